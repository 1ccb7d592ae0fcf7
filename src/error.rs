use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;

/// type alias for all operations on a [`Store`] that could fail with a [`StoreError`]
///
/// [`Store`]: ./struct.Store.html
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error variants used by the store.
/// It wraps any lower level errors from third party crates
#[derive(Error)]
pub enum StoreError {
    /// variant for errors caused by std::io
    #[error("IO error")]
    Io {
        /// source of the IO Error
        #[from]
        source: io::Error,
    },

    /// variant for errors when a key was not found in the store
    #[error("Key not found")]
    KeyNotFound,

    /// variant for errors when parsing strings to some other type
    #[error("{}", .0)]
    Parsing(String),

    /// variant for wire protocol violations: an unknown opcode or an
    /// unexpected response tag
    #[error("{}", .0)]
    Protocol(String),

    /// a key is an invalid UTF-8 sequence
    #[error("{}", .0)]
    Utf8Error(#[from] FromUtf8Error),
}

impl StoreError {
    /// returns `true` if this error was caused by a socket receive timeout,
    /// such as a `wait` whose keys were never set
    pub fn is_timeout(&self) -> bool {
        match self {
            StoreError::Io { source } => matches!(
                source.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// a custom Debug implementation that will write the entire error chain
impl std::fmt::Debug for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// writes the entire error chain of the given error `e`, to the formatter.
fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by: {}", cause)?;
        current = cause.source();
    }
    Ok(())
}
