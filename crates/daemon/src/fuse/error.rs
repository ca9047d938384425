use thiserror::Error;

use crate::client::ClientError;

/// Failure of a filesystem operation.
///
/// Driver callbacks report these to the kernel through [`FsError::errno`].
#[derive(Debug, Error)]
pub enum FsError {
    #[error("No such file or directory")]
    NotFound,

    #[error("File exists")]
    AlreadyExists,

    #[error("File name too long")]
    NameTooLong,

    #[error("Read-only file system")]
    ReadOnly,

    #[error("Directory not empty")]
    NotEmpty,

    #[error("Not a directory")]
    NotDirectory,

    #[error("Is a directory")]
    IsDirectory,

    #[error("Invalid argument")]
    InvalidArgument,

    #[error("Bad file descriptor")]
    BadHandle,

    #[error("Device or resource busy")]
    Busy,

    #[error("Inode database is no longer available")]
    Detached,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cloud error: {0}")]
    Client(#[from] ClientError),
}

impl FsError {
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::ReadOnly => libc::EROFS,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NotDirectory => libc::ENOTDIR,
            FsError::IsDirectory => libc::EISDIR,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::BadHandle => libc::EBADF,
            FsError::Busy => libc::EBUSY,
            FsError::Detached => libc::EIO,
            FsError::Io(error) => error.raw_os_error().unwrap_or(libc::EIO),
            FsError::Client(error) => error.errno(),
        }
    }
}
