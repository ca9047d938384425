//! Local staging of file content.
//!
//! Reading or writing a file requires a local copy of its content. Each copy
//! is described by a [`FileInfo`] shared between the open handles and, while
//! it holds unflushed changes, the owning inode. When the last reference is
//! dropped the staged copy is deleted.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::fuse::{FsError, InodeId};

/// Interned, lowercased file extension including the leading dot, or empty.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FileExtension(Arc<str>);

impl FileExtension {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for FileExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

/// Interns extensions so files sharing one share its storage.
#[derive(Debug, Default)]
pub struct FileExtensionDb {
    extensions: Mutex<HashMap<String, Weak<str>>>,
}

impl FileExtensionDb {
    /// Extension of the file called `name`.
    pub fn get(&self, name: &str) -> FileExtension {
        let extension = Path::new(name)
            .extension()
            .map(|extension| format!(".{}", extension.to_string_lossy().to_lowercase()))
            .unwrap_or_default();

        let mut extensions = self.extensions.lock();

        if let Some(existing) = extensions.get(&extension).and_then(Weak::upgrade) {
            return FileExtension(existing);
        }

        extensions.retain(|_, weak| weak.strong_count() > 0);

        let interned: Arc<str> = Arc::from(extension.as_str());
        extensions.insert(extension, Arc::downgrade(&interned));
        FileExtension(interned)
    }

    /// Number of distinct extensions currently in use.
    pub fn len(&self) -> usize {
        self.extensions
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct FileState {
    modified: i64,
    size: u64,
}

type Registry = Mutex<HashMap<InodeId, Weak<FileInfo>>>;

/// A staged copy of one file's content.
pub struct FileInfo {
    id: InodeId,
    extension: FileExtension,
    path: PathBuf,
    state: Mutex<FileState>,
    registry: Weak<Registry>,
}

impl FileInfo {
    pub fn id(&self) -> InodeId {
        self.id
    }

    pub fn extension(&self) -> &FileExtension {
        &self.extension
    }

    /// Location of the staged content.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn modified(&self) -> i64 {
        self.state.lock().modified
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn set_modified(&self, modified: i64) {
        self.state.lock().modified = modified;
    }

    pub fn set_size(&self, size: u64) {
        self.state.lock().size = size;
    }

    /// Open the staged content.
    pub fn open(&self, writable: bool) -> Result<File, FsError> {
        Ok(std::fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&self.path)?)
    }

    /// Number of live references to this record.
    pub fn references(this: &Arc<Self>) -> usize {
        Arc::strong_count(this)
    }
}

impl fmt::Debug for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.state.lock();
        f.debug_struct("FileInfo")
            .field("id", &self.id)
            .field("extension", &self.extension)
            .field("path", &self.path)
            .field("modified", &state.modified)
            .field("size", &state.size)
            .finish()
    }
}

impl Drop for FileInfo {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock();
            if registry
                .get(&self.id)
                .is_some_and(|weak| weak.strong_count() == 0)
            {
                registry.remove(&self.id);
            }
        }

        if let Err(error) = std::fs::remove_file(&self.path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(id = %self.id, %error, "unable to remove staged content");
            }
        }
    }
}

enum CacheDir {
    Owned(TempDir),
    Borrowed(PathBuf),
}

/// Owner of the staging directory and index of live [`FileInfo`]s.
pub struct FileCache {
    directory: CacheDir,
    extensions: FileExtensionDb,
    registry: Arc<Registry>,
    sequence: AtomicU64,
}

impl FileCache {
    /// Stage content under `directory`, created if missing.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, FsError> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(Self::with_directory(CacheDir::Borrowed(directory)))
    }

    /// Stage content in a private temporary directory removed on drop.
    pub fn temporary() -> Result<Self, FsError> {
        let directory = tempfile::Builder::new().prefix("cloudmount-").tempdir()?;
        Ok(Self::with_directory(CacheDir::Owned(directory)))
    }

    fn with_directory(directory: CacheDir) -> Self {
        Self {
            directory,
            extensions: FileExtensionDb::default(),
            registry: Arc::new(Mutex::new(HashMap::new())),
            sequence: AtomicU64::new(0),
        }
    }

    /// The live record for `id`, if any.
    pub fn get(&self, id: InodeId) -> Option<Arc<FileInfo>> {
        self.registry.lock().get(&id).and_then(Weak::upgrade)
    }

    /// The live record for `id`, or a new one with empty staged content.
    ///
    /// The boolean is `true` when the record was created by this call.
    pub fn create(&self, id: InodeId, name: &str, modified: i64) -> Result<(Arc<FileInfo>, bool), FsError> {
        let mut registry = self.registry.lock();

        if let Some(existing) = registry.get(&id).and_then(Weak::upgrade) {
            return Ok((existing, false));
        }

        // Names are never reused, so a record still being dropped cannot
        // delete its successor's content.
        let extension = self.extensions.get(name);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let path = self.directory().join(format!(
            "{:016x}-{}{}",
            id.get(),
            sequence,
            extension.as_str()
        ));

        File::create(&path)?;

        let info = Arc::new(FileInfo {
            id,
            extension,
            path,
            state: Mutex::new(FileState { modified, size: 0 }),
            registry: Arc::downgrade(&self.registry),
        });

        registry.insert(id, Arc::downgrade(&info));
        debug!(%id, path = ?info.path, "staged file created");

        Ok((info, true))
    }

    /* Getters */

    pub fn directory(&self) -> &Path {
        match &self.directory {
            CacheDir::Owned(directory) => directory.path(),
            CacheDir::Borrowed(directory) => directory,
        }
    }

    pub fn extensions(&self) -> &FileExtensionDb {
        &self.extensions
    }

    /// Number of live staged files.
    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for FileCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCache")
            .field("directory", &self.directory())
            .field("live", &self.len())
            .finish()
    }
}
