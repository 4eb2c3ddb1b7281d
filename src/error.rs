// src/error.rs

//! Error type shared by both backends.
//!
//! Every syscall failure is surfaced immediately as a structured [`Error`]
//! carrying the kernel's errno. Nothing is retried here; a caller that wants
//! to retry on `EINTR` can check [`Error::is_interrupted`].

use nix::errno::Errno;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The kernel refused a new notification instance, or a result buffer
    /// could not be allocated.
    #[error("failed to allocate {what}{}", errno_suffix(.errno))]
    Resource {
        what: &'static str,
        errno: Option<Errno>,
    },

    /// A syscall returned a failure status.
    #[error("{op} failed: {errno}")]
    Kernel { op: &'static str, errno: Errno },

    /// A dynamically supplied changelist element is not an event record.
    #[error("changelist element {index} must be {expected}, found {found}")]
    TypeMismatch {
        index: usize,
        expected: &'static str,
        found: String,
    },

    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
}

fn errno_suffix(errno: &Option<Errno>) -> String {
    match errno {
        Some(e) => format!(": {}", e),
        None => String::new(),
    }
}

impl Error {
    /// Builds a `Kernel` error from the calling thread's current errno.
    pub(crate) fn last_os(op: &'static str) -> Self {
        Error::Kernel {
            op,
            errno: Errno::last(),
        }
    }

    pub(crate) fn resource_from_last_os(what: &'static str) -> Self {
        Error::Resource {
            what,
            errno: Some(Errno::last()),
        }
    }

    /// The raw kernel error code, if this error came from a syscall.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Kernel { errno, .. } => Some(*errno as i32),
            Error::Resource {
                errno: Some(errno), ..
            } => Some(*errno as i32),
            _ => None,
        }
    }

    pub fn errno(&self) -> Option<Errno> {
        self.raw_os_error().map(Errno::from_raw)
    }

    pub fn is_interrupted(&self) -> bool {
        self.errno() == Some(Errno::EINTR)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err.raw_os_error() {
            Some(code) => io::Error::from_raw_os_error(code),
            None => io::Error::new(io::ErrorKind::InvalidInput, err),
        }
    }
}
