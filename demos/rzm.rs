// SPDX-License-Identifier: MIT OR Apache-2.0
//! Receive files over ZMODEM on stdin/stdout.

use clap::Parser;
use std::io::{Read, Write};
use std::sync::mpsc;
use std::time::Duration;
use zmodem_engine::{Config, Session, State};

#[derive(Parser)]
#[command(about = "Receive files over ZMODEM on stdin/stdout")]
struct Args {
    /// Download directory
    #[arg(default_value = ".")]
    dir: std::path::PathBuf,
}

fn main() {
    let args = Args::parse();
    let mut session = Session::receive(args.dir, Config::default()).expect("download directory");
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut buf = [0u8; 4096];
        while let Ok(n) = stdin.read(&mut buf) {
            if n == 0 || tx.send(buf[..n].to_vec()).is_err() {
                break;
            }
        }
    });

    let mut stdout = std::io::stdout().lock();
    let mut out = [0u8; 4096];
    loop {
        let input = rx
            .recv_timeout(Duration::from_millis(50))
            .unwrap_or_default();
        let step = session.step(&input, &mut out);
        if step.produced > 0 {
            stdout.write_all(&out[..step.produced]).expect("stdout");
            stdout.flush().expect("stdout");
        }
        if matches!(step.state, State::Complete | State::Aborted) && step.produced == 0 {
            break;
        }
    }

    let stats = session.stats();
    if session.state() == State::Aborted {
        eprintln!("{}", stats.message);
        std::process::exit(1);
    }
    eprintln!(
        "received {} ({} bytes)",
        stats.file_name, stats.batch_done
    );
}
