// SPDX-License-Identifier: MIT OR Apache-2.0
//! The active file of a transfer.

use crate::crc;
use crate::Error;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// One entry of the sender's batch.
#[derive(Clone, Debug)]
pub struct FileSpec {
    /// Full path on disk.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub mtime: u64,
}

impl FileSpec {
    /// Builds a spec by stat'ing `path`.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be stat'ed.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let meta = std::fs::metadata(&path)?;
        let mtime = meta
            .modified()?
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        Ok(Self {
            path,
            size: meta.len(),
            mtime,
        })
    }

    /// Basename advertised to the peer.
    #[must_use]
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// The one file open at a time between the idle gaps of a batch.
pub struct FileContext {
    name: String,
    path: PathBuf,
    size: u64,
    mtime: u64,
    file: File,
    position: u64,
}

impl FileContext {
    /// Opens a batch entry read-only for sending.
    ///
    /// The size is re-stat'ed; the file may have changed since the
    /// batch was assembled.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened or stat'ed.
    pub fn open_send(spec: &FileSpec) -> Result<Self, Error> {
        let file = File::open(&spec.path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            name: spec.name(),
            path: spec.path.clone(),
            size,
            mtime: spec.mtime,
            file,
            position: 0,
        })
    }

    /// Opens (or creates) a download target for writing without
    /// truncating, so a partial file survives for resumption.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be created.
    pub fn create_recv(path: PathBuf, name: &str, size: u64, mtime: u64) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            name: name.to_string(),
            path,
            size,
            mtime,
            file,
            position: 0,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Advertised size.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Moves the file cursor, e.g. on ZRPOS rewind or crash resume.
    ///
    /// # Errors
    ///
    /// Fails when the underlying seek fails.
    pub fn seek(&mut self, position: u64) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(position))?;
        self.position = position;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes at the cursor; short only at end
    /// of file.
    ///
    /// # Errors
    ///
    /// Fails when the underlying read fails.
    pub fn read_block(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.position += filled as u64;
        Ok(filled)
    }

    /// Appends a validated subpacket payload at the cursor.
    ///
    /// # Errors
    ///
    /// Fails when the underlying write fails.
    pub fn write_block(&mut self, data: &[u8]) -> Result<(), Error> {
        self.file.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    /// Flushes, applies the sender's mtime and closes.
    ///
    /// # Errors
    ///
    /// Fails when flushing or touching the file fails.
    pub fn finish_recv(mut self) -> Result<(), Error> {
        self.file.flush()?;
        self.file.sync_all()?;
        if self.mtime != 0 {
            let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(self.mtime);
            self.file.set_modified(mtime)?;
        }
        Ok(())
    }

    /// Drops the partial download from disk.
    ///
    /// # Errors
    ///
    /// Fails when the unlink fails.
    pub fn discard_recv(self) -> Result<(), Error> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(path)?;
        Ok(())
    }
}

/// Size of `path`, or `None` when it does not exist.
///
/// # Errors
///
/// Fails on stat errors other than not-found.
pub fn stat_len(path: &Path) -> Result<Option<u64>, Error> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.len())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(Error::from(err)),
    }
}

/// Canonical CRC32 over the first `len` bytes of `path`.
///
/// # Errors
///
/// Fails when the file is shorter than `len` or unreadable.
pub fn prefix_crc32(path: &Path, len: u64) -> Result<u32, Error> {
    let mut file = File::open(path)?;
    let mut digest = crc::CRC32.digest();
    let mut remaining = len;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(buf.len()));
        let got = file.read(&mut buf[..want])?;
        if got == 0 {
            return Err(Error::from(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        }
        digest.update(&buf[..got]);
        remaining -= got as u64;
    }
    Ok(digest.finalize())
}

/// First free `.NNNN` sibling of `name` in `dir`. Exhausting `.9999`
/// is treated as a disk failure.
///
/// # Errors
///
/// Fails when every suffix is taken.
pub fn collision_path(dir: &Path, name: &str) -> Result<PathBuf, Error> {
    for n in 0..10_000u32 {
        let candidate = dir.join(format!("{name}.{n:04}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(Error::from(std::io::Error::from(
        std::io::ErrorKind::AlreadyExists,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_prefix_crc32_matches_whole_file_crc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"123456789").unwrap();
        assert_eq!(prefix_crc32(&path, 9).unwrap(), 0xcbf4_3926);
    }

    #[test]
    fn test_create_recv_preserves_existing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"hello").unwrap();
        let mut ctx =
            FileContext::create_recv(path.clone(), "partial.bin", 10, 0).unwrap();
        ctx.seek(5).unwrap();
        ctx.write_block(b"world").unwrap();
        ctx.finish_recv().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"helloworld");
    }

    #[test]
    fn test_collision_path_skips_taken_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("a.bin.0000")).unwrap();
        f.write_all(b"taken").unwrap();
        let next = collision_path(dir.path(), "a.bin").unwrap();
        assert_eq!(next, dir.path().join("a.bin.0001"));
    }

    #[test]
    fn test_read_block_short_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"abc").unwrap();
        let spec = FileSpec::from_path(&path).unwrap();
        let mut ctx = FileContext::open_send(&spec).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(ctx.read_block(&mut buf).unwrap(), 3);
        assert_eq!(ctx.position(), 3);
    }
}
