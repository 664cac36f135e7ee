//! Atomic file replacement.
//!
//! Writes go to a sibling `<name>.tmp` file which is flushed, fsynced and
//! then renamed over the target. Until the rename succeeds the previous
//! version of the file is untouched; a write abandoned on any path (error,
//! early return, panic) removes its temp file when the [`PendingWrite`] is
//! dropped.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

/// Number of write-then-rename attempts before giving up.
pub const WRITE_ATTEMPTS: usize = 3;

/// Suffix appended to the target filename for the in-progress copy.
pub const TEMP_SUFFIX: &str = ".tmp";

/// A file that is only ever replaced as a whole.
#[derive(Debug, Clone)]
pub struct AtomicFile {
    path: PathBuf,
}

impl AtomicFile {
    /// Create a handle for `path`. Nothing is touched on disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the committed file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the in-progress copy.
    pub fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(TEMP_SUFFIX);
        PathBuf::from(name)
    }

    /// Read the committed file. Returns `None` if it does not exist.
    ///
    /// A leftover temp file is never consulted.
    pub fn read_to_string(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read the committed file as bytes. Returns `None` if it does not exist.
    pub fn read(&self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Begin a replacement. The returned writer must be committed for the
    /// new content to become visible.
    pub fn start_write(&self) -> io::Result<PendingWrite> {
        let temp_path = self.temp_path();
        let file = File::create(&temp_path)?;
        Ok(PendingWrite {
            writer: Some(BufWriter::new(file)),
            temp_path,
            target: self.path.clone(),
        })
    }

    /// Replace the file with `data`, retrying up to [`WRITE_ATTEMPTS`] times.
    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut last_error = None;

        for attempt in 0..WRITE_ATTEMPTS {
            let result = self.start_write().and_then(|mut pending| {
                pending.write_all(data)?;
                pending.commit()
            });

            match result {
                Ok(()) => {
                    debug!(
                        "Wrote {} ({} bytes, attempt {})",
                        self.path.display(),
                        data.len(),
                        attempt + 1
                    );
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| io::Error::other("no write attempted")))
    }

    /// Delete the committed file and any leftover temp file.
    ///
    /// Returns whether the committed file existed.
    pub fn delete(&self) -> io::Result<bool> {
        let _ = fs::remove_file(self.temp_path());
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// An in-progress replacement of an [`AtomicFile`].
#[derive(Debug)]
pub struct PendingWrite {
    writer: Option<BufWriter<File>>,
    temp_path: PathBuf,
    target: PathBuf,
}

impl PendingWrite {
    /// Flush, fsync and rename the temp file over the target.
    pub fn commit(mut self) -> io::Result<()> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| io::Error::other("pending write already closed"))?;
        let file = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.temp_path, &self.target)?;
        // Nothing left for Drop to discard.
        self.temp_path.clear();
        Ok(())
    }
}

impl Write for PendingWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(io::Error::other("pending write already closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        drop(self.writer.take());
        if !self.temp_path.as_os_str().is_empty() {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read() {
        let dir = TempDir::new().expect("temp dir");
        let file = AtomicFile::new(dir.path().join("10.xml"));

        assert_eq!(file.read_to_string().expect("read"), None);
        file.write(b"first").expect("write");
        assert_eq!(file.read_to_string().expect("read").as_deref(), Some("first"));
        file.write(b"second").expect("write");
        assert_eq!(file.read().expect("read"), Some(b"second".to_vec()));
        assert!(!file.temp_path().exists());
    }

    #[test]
    fn test_temp_path_appends_suffix() {
        let file = AtomicFile::new("/data/system/users/userlist.xml");
        assert_eq!(
            file.temp_path(),
            PathBuf::from("/data/system/users/userlist.xml.tmp")
        );
    }

    #[test]
    fn test_abandoned_write_keeps_previous_version() {
        let dir = TempDir::new().expect("temp dir");
        let file = AtomicFile::new(dir.path().join("10.xml"));
        file.write(b"committed").expect("write");

        {
            let mut pending = file.start_write().expect("start");
            pending.write_all(b"half-writ").expect("partial write");
            assert!(file.temp_path().exists());
            // dropped without commit
        }

        assert!(!file.temp_path().exists());
        assert_eq!(
            file.read_to_string().expect("read").as_deref(),
            Some("committed")
        );
    }

    #[test]
    fn test_stale_temp_file_is_ignored_and_replaced() {
        let dir = TempDir::new().expect("temp dir");
        let file = AtomicFile::new(dir.path().join("userlist.xml"));
        file.write(b"good").expect("write");
        fs::write(file.temp_path(), b"torn write from a crash").expect("stale temp");

        assert_eq!(file.read_to_string().expect("read").as_deref(), Some("good"));

        file.write(b"newer").expect("write");
        assert_eq!(file.read_to_string().expect("read").as_deref(), Some("newer"));
        assert!(!file.temp_path().exists());
    }

    #[test]
    fn test_write_into_missing_directory_fails_cleanly() {
        let dir = TempDir::new().expect("temp dir");
        let file = AtomicFile::new(dir.path().join("missing").join("10.xml"));
        assert!(file.write(b"data").is_err());
        assert!(!file.path().exists());
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().expect("temp dir");
        let file = AtomicFile::new(dir.path().join("11.xml"));
        assert!(!file.delete().expect("delete missing"));
        file.write(b"x").expect("write");
        assert!(file.delete().expect("delete"));
        assert!(!file.path().exists());
    }
}
