//! Pid file naming the process that currently owns the listening socket.
//!
//! Writes go through a temporary file and a rename so readers never observe
//! a half-written pid. Removal is conditional: a draining process only
//! deletes the file while it still names itself, which keeps it from erasing
//! the pid its replacement already wrote, even when that write races the
//! removal.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::error::PidFileError;

#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the file contents with `pid`.
    pub fn write(&self, pid: u32) -> Result<(), PidFileError> {
        let tmp = self.sibling(&format!(".{pid}.tmp"));

        let result = (|| {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o660)
                .open(&tmp)?;
            file.write_all(pid.to_string().as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        })();

        result.map_err(|source| {
            let _ = fs::remove_file(&tmp);
            self.io_error(source)
        })
    }

    /// Read the pid currently recorded. `None` if the file does not exist.
    pub fn read(&self) -> Result<Option<u32>, PidFileError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };

        contents
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PidFileError::Malformed {
                path: self.path.clone(),
                contents,
            })
    }

    /// Delete the file if it still names `pid`.
    ///
    /// The file is renamed to a private claim path before the final check,
    /// so a replacement's write lands either before the claim (and is put
    /// back) or after it (and is never touched). While a foreign entry is
    /// being put back, readers can briefly find no file.
    ///
    /// Returns `true` if the file was removed.
    pub fn remove_if_owned(&self, pid: u32) -> Result<bool, PidFileError> {
        if self.read()? != Some(pid) {
            return Ok(false);
        }

        let claim = self.claim_path(pid);
        match fs::rename(&self.path, &claim) {
            Ok(()) => self.settle_claim(&claim, pid),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Delete a claimed file that names `pid`, otherwise restore it unless a
    /// newer entry already took its place.
    fn settle_claim(&self, claim: &Path, pid: u32) -> Result<bool, PidFileError> {
        let contents = fs::read_to_string(claim).map_err(|e| self.io_error(e))?;
        let owned = contents.trim().parse::<u32>().ok() == Some(pid);

        if !owned {
            match fs::hard_link(claim, &self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(self.io_error(e)),
            }
        }

        fs::remove_file(claim).map_err(|e| self.io_error(e))?;
        Ok(owned)
    }

    fn claim_path(&self, pid: u32) -> PathBuf {
        self.sibling(&format!(".{pid}.remove"))
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn io_error(&self, source: io::Error) -> PidFileError {
        PidFileError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
