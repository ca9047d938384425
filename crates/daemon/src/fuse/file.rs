//! File content: staging, open handles and upload.
//!
//! A file's content is staged in the [`FileCache`](crate::fuse::FileCache)
//! the first time it is opened. Writes go to the staged copy and mark the
//! inode dirty; the staged copy is then kept alive by the inode until a
//! flush uploads it.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::client::Permissions;
use crate::fuse::{FileInfo, FsError, Inode, InodeRef};

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Default)]
pub struct FileInode {
    /// Staged content holding changes not yet uploaded.
    dirty: Mutex<Option<Arc<FileInfo>>>,
    modified: AtomicBool,
}

impl FileInode {
    /// Size of the unflushed content, if any.
    pub(crate) fn staged_size(&self) -> Option<u64> {
        self.dirty.lock().as_ref().map(|info| info.size())
    }

    fn mark_dirty(&self, info: &Arc<FileInfo>) {
        let previous = self.dirty.lock().replace(info.clone());
        self.modified.store(true, Ordering::SeqCst);
        drop(previous);
    }
}

/// An open file.
pub struct FileHandle {
    inode: InodeRef,
    info: Arc<FileInfo>,
    file: Mutex<File>,
    writable: bool,
}

impl FileHandle {
    /// Read up to `size` bytes starting at `offset`.
    pub fn read(&self, offset: u64, size: usize) -> Result<Vec<u8>, FsError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = Vec::with_capacity(size);
        Read::by_ref(&mut *file)
            .take(size as u64)
            .read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    /// Write `data` at `offset`, returning the number of bytes written.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        if !self.writable {
            return Err(FsError::BadHandle);
        }

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FsError::InvalidArgument)?;

        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;
        }

        if end > self.info.size() {
            self.info.set_size(end);
        }

        let modified = now();
        self.info.set_modified(modified);
        self.inode.describe(|description| description.modified = modified);
        self.inode.file()?.mark_dirty(&self.info);

        Ok(data.len())
    }

    /// Upload any changes made through this or another handle.
    pub fn flush(&self) -> Result<(), FsError> {
        self.file.lock().flush()?;
        self.inode.flush()
    }

    pub fn size(&self) -> u64 {
        self.info.size()
    }

    pub fn inode(&self) -> &InodeRef {
        &self.inode
    }

    pub fn writable(&self) -> bool {
        self.writable
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("inode", &self.inode.id())
            .field("writable", &self.writable)
            .finish()
    }
}

impl Inode {
    /// Open this file, staging its content if necessary.
    pub fn open(self: &Arc<Self>, writable: bool, truncate: bool) -> Result<FileHandle, FsError> {
        self.file()?;
        if self.removed() {
            return Err(FsError::NotFound);
        }
        if (writable || truncate) && self.permissions() == Permissions::ReadOnly {
            return Err(FsError::ReadOnly);
        }

        if truncate {
            self.truncate(0)?;
        }

        let info = self.content()?;
        let file = info.open(writable)?;

        Ok(FileHandle {
            inode: self.clone(),
            info,
            file: Mutex::new(file),
            writable,
        })
    }

    /// Resize the content to `size` bytes.
    pub fn truncate(&self, size: u64) -> Result<(), FsError> {
        let file = self.file()?;
        if self.removed() {
            return Err(FsError::NotFound);
        }
        if self.permissions() == Permissions::ReadOnly {
            return Err(FsError::ReadOnly);
        }

        let info = self.content()?;
        info.open(true)?.set_len(size)?;
        info.set_size(size);

        let modified = now();
        info.set_modified(modified);
        self.describe(|description| description.modified = modified);
        file.mark_dirty(&info);

        Ok(())
    }

    /// Set the modification time.
    pub fn touch(&self, modified: i64) -> Result<(), FsError> {
        let file = self.file()?;
        if self.removed() {
            return Err(FsError::NotFound);
        }

        let info = self.content()?;
        info.set_modified(modified);
        self.describe(|description| description.modified = modified);
        file.mark_dirty(&info);

        Ok(())
    }

    /// Whether the file holds changes not yet uploaded.
    pub fn was_modified(&self) -> bool {
        self.file()
            .map(|file| file.modified.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Upload unflushed changes. Files without changes are left alone.
    pub fn flush(&self) -> Result<(), FsError> {
        let file = self.file()?;

        let Some(info) = file.dirty.lock().clone() else {
            return Ok(());
        };

        if self.removed() {
            let discarded = file.dirty.lock().take();
            file.modified.store(false, Ordering::SeqCst);
            drop(discarded);
            return Ok(());
        }

        let db = self.db()?;
        let parent = self
            .parent()
            .and_then(|parent| db.get(parent))
            .ok_or(FsError::NotFound)?;
        let parent_handle = parent.handle().ok_or(FsError::NotFound)?;

        // Writes racing with the upload set the flag again.
        file.modified.store(false, Ordering::SeqCst);

        let node = match db.client().upload(parent_handle, &self.name(), info.path()) {
            Ok(node) => node,
            Err(error) => {
                file.modified.store(true, Ordering::SeqCst);
                warn!(id = %self.id(), %error, "upload failed");
                return Err(error.into());
            }
        };

        let released = db.bind(self, &node);
        debug!(id = %self.id(), handle = %node.handle, size = node.size, "file flushed");

        let discarded = if file.modified.load(Ordering::SeqCst) {
            None
        } else {
            file.dirty.lock().take()
        };

        drop(discarded);
        drop(released);

        Ok(())
    }

    /// Stage empty content for a file that only exists locally.
    pub(crate) fn stage_empty(&self) -> Result<(), FsError> {
        let file = self.file()?;
        let info = self.content()?;
        file.mark_dirty(&info);
        Ok(())
    }

    /// The staged content, downloading it on first use.
    fn content(&self) -> Result<Arc<FileInfo>, FsError> {
        let file = self.file()?;

        // Held while downloading so concurrent opens see complete content.
        let dirty = file.dirty.lock();
        if let Some(info) = dirty.as_ref() {
            return Ok(info.clone());
        }

        let db = self.db()?;
        let (info, created) = db.files().create(self.id(), &self.name(), self.modified())?;

        if created {
            if let Some(handle) = self.handle() {
                db.client().download(handle, info.path())?;
            }
            let size = std::fs::metadata(info.path())?.len();
            info.set_size(size);
        }

        drop(dirty);
        Ok(info)
    }
}
