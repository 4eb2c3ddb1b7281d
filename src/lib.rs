//! evq: thin, safe bindings to kernel readiness notification.
//!
//! Two independent backends, each a straight pipeline of "build records,
//! issue the syscall, convert the results":
//!
//! - [`epoll`] (Linux): interest masks on file descriptors, results are
//!   `(triggered_mask, fd)` pairs.
//! - [`kqueue`] (BSD/macOS): [`kevent::KEvent`] records with filters, action
//!   flags, filter data and a reference-counted user tag.
//!
//! The record shapes and constant namespaces are deliberately not unified.
//! Which backends exist is decided by `build.rs` from the target OS and the
//! `epoll` / `kqueue` features.

pub mod changes;
pub mod config;
pub mod error;
pub mod kevent;
pub mod tags;
pub mod timeout;

#[cfg(evq_epoll)]
pub mod epoll;

#[cfg(evq_kqueue)]
pub mod kqueue;


#[cfg(all(test, evq_kqueue))]
mod kqueue_tests;

pub use error::{Error, Result};
