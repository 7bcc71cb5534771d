//! Flat, id-addressed storage for batch input and output files.
//!
//! Input files are written once at upload time and never touched again.
//! Output files are append-only: the executor appends one JSONL line per
//! finished request and syncs before advancing, which makes the line count
//! of the output the durable resume cursor after a crash.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn path(&self, file_id: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", file_id))
    }

    pub fn exists(&self, file_id: &str) -> bool {
        self.path(file_id).exists()
    }

    /// Store an immutable input file. Returns the number of bytes written.
    pub fn put(&self, file_id: &str, contents: &[u8]) -> Result<u64, StoreError> {
        let path = self.path(file_id);
        let mut file = File::create(&path).map_err(|source| io_error(&path, source))?;
        file.write_all(contents)
            .and_then(|_| file.sync_all())
            .map_err(|source| io_error(&path, source))?;
        Ok(contents.len() as u64)
    }

    pub fn get(&self, file_id: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path(file_id);
        if !path.exists() {
            return Err(StoreError::NotFound(file_id.to_string()));
        }
        let mut contents = Vec::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut contents))
            .map_err(|source| io_error(&path, source))?;
        Ok(contents)
    }

    /// Append one line to an output file, creating it on first use, and sync
    /// to disk before returning. The caller must not advance its cursor until
    /// this has returned.
    pub fn append_line(&self, file_id: &str, line: &str) -> Result<(), StoreError> {
        let path = self.path(file_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| io_error(&path, source))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .and_then(|_| file.sync_all())
            .map_err(|source| io_error(&path, source))
    }

    /// Count complete (newline-terminated) lines in a file. A trailing
    /// partial line is not counted. Missing files count zero lines.
    pub fn count_lines(&self, file_id: &str) -> Result<u64, StoreError> {
        let path = self.path(file_id);
        if !path.exists() {
            return Ok(0);
        }
        let file = File::open(&path).map_err(|source| io_error(&path, source))?;
        let mut reader = BufReader::new(file);
        let mut count = 0u64;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .map_err(|source| io_error(&path, source))?;
            if read == 0 {
                break;
            }
            if buf.ends_with(b"\n") {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Truncate a file to its complete lines, dropping a partial trailing
    /// line left by a crash mid-append. Returns the surviving line count.
    pub fn truncate_to_complete_lines(&self, file_id: &str) -> Result<u64, StoreError> {
        let path = self.path(file_id);
        if !path.exists() {
            return Ok(0);
        }

        let file = File::open(&path).map_err(|source| io_error(&path, source))?;
        let mut reader = BufReader::new(file);
        let mut complete_bytes = 0u64;
        let mut lines = 0u64;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .map_err(|source| io_error(&path, source))?;
            if read == 0 {
                break;
            }
            if buf.ends_with(b"\n") {
                complete_bytes += read as u64;
                lines += 1;
            }
        }

        let actual_len = fs::metadata(&path)
            .map_err(|source| io_error(&path, source))?
            .len();
        if actual_len > complete_bytes {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|source| io_error(&path, source))?;
            file.set_len(complete_bytes)
                .map_err(|source| io_error(&path, source))?;
            file.sync_all().map_err(|source| io_error(&path, source))?;
        }

        Ok(lines)
    }

    /// Seek past the first `lines` lines and return the rest of the file.
    pub fn read_from_line(&self, file_id: &str, lines: u64) -> Result<Vec<u8>, StoreError> {
        let path = self.path(file_id);
        if !path.exists() {
            return Err(StoreError::NotFound(file_id.to_string()));
        }
        let file = File::open(&path).map_err(|source| io_error(&path, source))?;
        let mut reader = BufReader::new(file);
        let mut skipped = 0u64;
        let mut buf = Vec::new();
        while skipped < lines {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .map_err(|source| io_error(&path, source))?;
            if read == 0 {
                break;
            }
            skipped += 1;
        }
        let mut rest = Vec::new();
        reader
            .read_to_end(&mut rest)
            .map_err(|source| io_error(&path, source))?;
        Ok(rest)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}
