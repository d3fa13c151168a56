//! Bag resources and how they are opened
//!
//! The cache does not know how to read a bag. It delegates opening to a
//! [`BagOpener`] supplied by the composition root and only manages the
//! lifetime of what comes back. [`FileOpener`] covers the common case of a
//! read-only handle on the bag's data file.

use crate::key::locate_data_file;
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// An opened bag
pub trait BagResource: Send + 'static {
    /// Return to a clean state at the start of every lease
    ///
    /// Called by [`Handle::acquire`](crate::Handle::acquire) before the
    /// resource is handed out, so one lease never observes where the
    /// previous one stopped reading.
    fn reset(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Release the underlying resource
    ///
    /// Called exactly once by the owning handle before the resource is
    /// dropped. Errors are logged by the pool and never block eviction.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens bags at a canonical path
pub trait BagOpener: Send + Sync + 'static {
    type Resource: BagResource;

    /// Open the bag at `path`
    ///
    /// This is a blocking call and runs without any pool lock held.
    fn open(&self, path: &Path) -> io::Result<Self::Resource>;
}

impl<F, R> BagOpener for F
where
    F: Fn(&Path) -> io::Result<R> + Send + Sync + 'static,
    R: BagResource,
{
    type Resource = R;

    fn open(&self, path: &Path) -> io::Result<R> {
        self(path)
    }
}

/// Read-only handle on a bag's data file
#[derive(Debug)]
pub struct BagFile {
    path: PathBuf,
    file: Option<File>,
    len: u64,
}

impl BagFile {
    /// Path of the data file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the data file when it was opened
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Check if the data file was empty when opened
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Underlying file, `None` once closed
    pub const fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }
}

impl BagResource for BagFile {
    fn reset(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.seek(SeekFrom::Start(0))?;
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.file.take();
        Ok(())
    }
}

/// Opens the data file of a bag (the file itself, or the single data file
/// inside a bag directory) read-only
#[derive(Debug, Clone, Copy, Default)]
pub struct FileOpener;

impl BagOpener for FileOpener {
    type Resource = BagFile;

    fn open(&self, path: &Path) -> io::Result<BagFile> {
        let data_file = locate_data_file(path).map_err(io::Error::other)?;
        let file = File::open(&data_file)?;
        let len = file.metadata()?.len();
        Ok(BagFile {
            path: data_file,
            file: Some(file),
            len,
        })
    }
}
