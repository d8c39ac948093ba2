//! Error handling for the ordering engine
//!
//! Fatal failures (unreadable input, temporary storage, bad configuration) are
//! `SortError`s and abort the run. Record-level problems are `KeyError`s; they
//! never escape a sorter and are reported through [`crate::diagnostics`].

use std::io;
use std::path::Path;
use thiserror::Error;

/// Custom error type for sort operations
#[derive(Error, Debug)]
pub enum SortError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Permission denied: {file}")]
    PermissionDenied { file: String },

    #[error("No such file or directory: {file}")]
    FileNotFound { file: String },

    #[error("Is a directory: {file}")]
    IsDirectory { file: String },

    #[error("Not a regular file, cannot be mapped: {file}")]
    NotRegularFile { file: String },

    #[error("Cannot create temporary file in {dir}: {source}")]
    TempFile {
        dir: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid buffer size: {size}")]
    InvalidBufferSize { size: String },

    #[error("Conflicting options: {message}")]
    ConflictingOptions { message: String },

    #[error("Thread pool error: {message}")]
    ThreadPoolError { message: String },

    #[error("Parse error: {message}")]
    ParseError { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SortError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        crate::SORT_FAILURE
    }

    /// Create a permission denied error
    pub fn permission_denied(file: &str) -> Self {
        SortError::PermissionDenied {
            file: file.to_string(),
        }
    }

    /// Create a file not found error
    pub fn file_not_found(file: &str) -> Self {
        SortError::FileNotFound {
            file: file.to_string(),
        }
    }

    /// Create an is directory error
    pub fn is_directory(file: &str) -> Self {
        SortError::IsDirectory {
            file: file.to_string(),
        }
    }

    /// Create an error for a pipe, socket or device given to the mapped path
    pub fn not_regular_file(file: &str) -> Self {
        SortError::NotRegularFile {
            file: file.to_string(),
        }
    }

    /// Create a temporary-storage error for `dir`
    pub fn temp_file(dir: &Path, source: io::Error) -> Self {
        SortError::TempFile {
            dir: dir.display().to_string(),
            source,
        }
    }

    /// Create an invalid buffer size error
    pub fn invalid_buffer_size(size: &str) -> Self {
        SortError::InvalidBufferSize {
            size: size.to_string(),
        }
    }

    /// Create a conflicting options error
    pub fn conflicting_options(message: &str) -> Self {
        SortError::ConflictingOptions {
            message: message.to_string(),
        }
    }

    /// Create a thread pool error
    pub fn thread_pool_error(message: &str) -> Self {
        SortError::ThreadPoolError {
            message: message.to_string(),
        }
    }

    /// Create a parse error
    pub fn parse_error(message: &str) -> Self {
        SortError::ParseError {
            message: message.to_string(),
        }
    }

    /// Create an internal error
    pub fn internal(message: &str) -> Self {
        SortError::Internal {
            message: message.to_string(),
        }
    }
}

/// Result type for sort operations
pub type SortResult<T> = Result<T, SortError>;

/// Why a data line could not yield a sort key.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyError {
    #[error("fewer than two tab-separated fields")]
    MissingFields,

    #[error("position is not a non-negative integer")]
    InvalidPosition,
}

/// Context trait for adding context to errors
pub trait SortContext<T> {
    fn with_context<F>(self, f: F) -> SortResult<T>
    where
        F: FnOnce() -> String;

    fn with_file_context(self, filename: &str) -> SortResult<T>;
}

fn file_error(io_err: io::Error, filename: &str) -> SortError {
    match io_err.kind() {
        io::ErrorKind::PermissionDenied => SortError::permission_denied(filename),
        io::ErrorKind::NotFound => SortError::file_not_found(filename),
        _ if Path::new(filename).is_dir() => SortError::is_directory(filename),
        _ => SortError::Io(io::Error::new(
            io_err.kind(),
            format!("{filename}: {io_err}"),
        )),
    }
}

impl<T> SortContext<T> for SortResult<T> {
    fn with_context<F>(self, f: F) -> SortResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|err| match err {
            SortError::Io(io_err) => SortError::Io(io::Error::new(
                io_err.kind(),
                format!("{}: {}", f(), io_err),
            )),
            other => other,
        })
    }

    fn with_file_context(self, filename: &str) -> SortResult<T> {
        self.map_err(|err| match err {
            SortError::Io(io_err) => file_error(io_err, filename),
            other => other,
        })
    }
}

impl<T> SortContext<T> for Result<T, io::Error> {
    fn with_context<F>(self, f: F) -> SortResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|io_err| {
            SortError::Io(io::Error::new(
                io_err.kind(),
                format!("{}: {}", f(), io_err),
            ))
        })
    }

    fn with_file_context(self, filename: &str) -> SortResult<T> {
        self.map_err(|io_err| file_error(io_err, filename))
    }
}
