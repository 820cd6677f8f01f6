// SPDX-License-Identifier: MIT OR Apache-2.0
//! Send files over ZMODEM on stdin/stdout.

use clap::Parser;
use std::io::{Read, Write};
use std::sync::mpsc;
use std::time::Duration;
use zmodem_engine::{Config, FileSpec, Session, State};

#[derive(Parser)]
#[command(about = "Send files over ZMODEM on stdin/stdout")]
struct Args {
    /// Files to send
    #[arg(required = true)]
    files: Vec<std::path::PathBuf>,
}

fn main() {
    let args = Args::parse();
    let specs: Vec<FileSpec> = args
        .files
        .iter()
        .map(|path| FileSpec::from_path(path).expect("stat file"))
        .collect();
    let mut session = Session::send(specs, Config::default()).expect("batch");
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
    eprintln!("sent {} bytes", stats.batch_done);
}
