#[derive(Debug, Eq, PartialEq)]
pub enum FsError {
    // Same as std::io::ErrorKind
    NotFound,
    PermissionDenied,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    ReadOnlyFilesystem,
    FilesystemLoop,
    InvalidInput,
    InvalidData,
    WriteZero,
    StorageFull,
    FileTooLarge,
    ResourceBusy,
    CrossesDevices,
    TooManyLinks,
    InvalidFilename,
    NameTooLong,
    ArgumentListTooLong,
    Interrupted,
    Unsupported,
    UnexpectedEof,
    OutOfMemory,

    // Errors specific to this crate
    CryptoError,
    IntegrityCheckError,
    RwLockError,
    MutexError,
    NoUpperLayer,
    NotOpaque,

    UnknownError,
}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for FsError {}

pub type FsResult<T> = Result<T, FsError>;

impl From<std::io::ErrorKind> for FsError {
    fn from(value: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind as K;
        match value {
            K::NotFound => Self::NotFound,
            K::PermissionDenied => Self::PermissionDenied,
            K::AlreadyExists => Self::AlreadyExists,
            K::InvalidInput => Self::InvalidInput,
            K::InvalidData => Self::InvalidData,
            K::WriteZero => Self::WriteZero,
            K::Interrupted => Self::Interrupted,
            K::Unsupported => Self::Unsupported,
            K::UnexpectedEof => Self::UnexpectedEof,
            K::OutOfMemory => Self::OutOfMemory,
            _ => Self::UnknownError,
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(value: std::io::Error) -> Self {
        // raw_os_error carries precision ErrorKind collapses away, which
        // matters for the not-empty / cross-device / too-many-links cases.
        match value.raw_os_error() {
            Some(libc::ENOTEMPTY) => Self::DirectoryNotEmpty,
            Some(libc::EXDEV) => Self::CrossesDevices,
            Some(libc::EMLINK) => Self::TooManyLinks,
            Some(libc::ENOTDIR) => Self::NotADirectory,
            Some(libc::EISDIR) => Self::IsADirectory,
            Some(libc::EROFS) => Self::ReadOnlyFilesystem,
            Some(libc::ELOOP) => Self::FilesystemLoop,
            Some(libc::ENOSPC) => Self::StorageFull,
            Some(libc::EFBIG) => Self::FileTooLarge,
            Some(libc::EBUSY) => Self::ResourceBusy,
            Some(libc::ENAMETOOLONG) => Self::NameTooLong,
            Some(libc::E2BIG) => Self::ArgumentListTooLong,
            _ => Into::<FsError>::into(value.kind()),
        }
    }
}

use libc::c_int;
impl From<FsError> for c_int {
    fn from(value: FsError) -> Self {
        match value {
            FsError::NotFound => libc::ENOENT,
            FsError::PermissionDenied => libc::EACCES,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::DirectoryNotEmpty => libc::ENOTEMPTY,
            FsError::ReadOnlyFilesystem => libc::EROFS,
            FsError::FilesystemLoop => libc::ELOOP,
            FsError::InvalidInput => libc::EINVAL,
            FsError::InvalidData => libc::EINVAL,
            FsError::WriteZero => libc::EIO,
            FsError::StorageFull => libc::ENOSPC,
            FsError::FileTooLarge => libc::EFBIG,
            FsError::ResourceBusy => libc::EBUSY,
            FsError::CrossesDevices => libc::EXDEV,
            FsError::TooManyLinks => libc::EMLINK,
            FsError::InvalidFilename => libc::EINVAL,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::ArgumentListTooLong => libc::E2BIG,
            FsError::Interrupted => libc::EINTR,
            FsError::Unsupported => libc::ENOSYS,
            FsError::UnexpectedEof => libc::EIO,
            FsError::OutOfMemory => libc::ENOMEM,

            FsError::CryptoError => libc::EIO,
            FsError::IntegrityCheckError => libc::EBADMSG,
            FsError::RwLockError => libc::EIO,
            FsError::MutexError => libc::EIO,
            FsError::NoUpperLayer => libc::EROFS,
            FsError::NotOpaque => libc::EINVAL,

            FsError::UnknownError => libc::EIO,
        }
    }
}
