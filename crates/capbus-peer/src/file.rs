//! File references and the per-bus file table.
//!
//! Messages carry duplicated references to open files, one set per
//! destination, so each instance owns its attachments independently of the
//! sender. The table maps caller file-descriptor integers to refcounted
//! file objects and keeps a gauge of outstanding references for the
//! resource-conservation checks.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use capbus_error::{BusError, Result};

/// An open file as far as the bus is concerned.
#[derive(Debug)]
pub struct FileObject {
    fd: i32,
}

impl FileObject {
    #[must_use]
    pub fn fd(&self) -> i32 {
        self.fd
    }
}

/// An owning reference to a [`FileObject`].
///
/// Cloning duplicates the reference (each message instance owns its own);
/// dropping releases it. The table gauge tracks every outstanding `FileRef`.
pub struct FileRef {
    obj: Arc<FileObject>,
    live: Arc<AtomicUsize>,
}

impl FileRef {
    #[must_use]
    pub fn fd(&self) -> i32 {
        self.obj.fd
    }

    /// Whether two references name the same file object.
    #[must_use]
    pub fn same_file(&self, other: &FileRef) -> bool {
        Arc::ptr_eq(&self.obj, &other.obj)
    }
}

impl Clone for FileRef {
    fn clone(&self) -> Self {
        self.live.fetch_add(1, Ordering::Relaxed);
        Self {
            obj: Arc::clone(&self.obj),
            live: Arc::clone(&self.live),
        }
    }
}

impl Drop for FileRef {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRef").field("fd", &self.obj.fd).finish()
    }
}

impl PartialEq for FileRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_file(other)
    }
}

/// Maps file-descriptor integers to file objects.
#[derive(Debug, Default)]
pub struct FileTable {
    files: Mutex<HashMap<i32, Arc<FileObject>>>,
    live: Arc<AtomicUsize>,
}

impl FileTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `fd` as an open file.
    pub fn install(&self, fd: i32) {
        self.files.lock().insert(fd, Arc::new(FileObject { fd }));
    }

    /// Obtain an owning reference for the file behind `fd`.
    pub fn import_fd(&self, fd: i32) -> Result<FileRef> {
        let files = self.files.lock();
        let obj = files
            .get(&fd)
            .ok_or(BusError::BadFileDescriptor { fd })?;
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(FileRef {
            obj: Arc::clone(obj),
            live: Arc::clone(&self.live),
        })
    }

    /// Outstanding [`FileRef`]s issued from this table.
    #[must_use]
    pub fn live_refs(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}
