// src/kevent.rs

//! The kqueue event record.
//!
//! A [`KEvent`] is used both as a registration request (pushed through the
//! changelist) and as a result (returned by a wait). The scalar fields are
//! stored verbatim: an out-of-range filter or flag is representable here and
//! only rejected by the kernel. The user tag is an `Arc` so the record shares
//! ownership of it rather than aliasing a raw pointer.
//!
//! This module only describes the record shape and compiles everywhere; the
//! named filter/flag values exist where the kqueue backend is built.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Which condition class a registration is interested in.
///
/// A transparent wrapper over the kernel's filter value. On macOS and most
/// BSDs the kernel field is an `i16`; NetBSD widens it to `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(pub i32);

#[cfg(evq_kqueue)]
impl Filter {
    pub const READ: Filter = Filter(libc::EVFILT_READ as i32);
    pub const WRITE: Filter = Filter(libc::EVFILT_WRITE as i32);
    pub const AIO: Filter = Filter(libc::EVFILT_AIO as i32);
    pub const VNODE: Filter = Filter(libc::EVFILT_VNODE as i32);
    pub const PROC: Filter = Filter(libc::EVFILT_PROC as i32);
    pub const SIGNAL: Filter = Filter(libc::EVFILT_SIGNAL as i32);
    pub const TIMER: Filter = Filter(libc::EVFILT_TIMER as i32);
}

impl Filter {
    pub const fn raw(self) -> i32 {
        self.0
    }
}

bitflags! {
    /// Action flags (`EV_*`). Bits this crate does not name are kept as-is.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct EventFlags: u32 {
        #[cfg(evq_kqueue)]
        const ADD = libc::EV_ADD as u32;
        #[cfg(evq_kqueue)]
        const DELETE = libc::EV_DELETE as u32;
        #[cfg(evq_kqueue)]
        const ENABLE = libc::EV_ENABLE as u32;
        #[cfg(evq_kqueue)]
        const DISABLE = libc::EV_DISABLE as u32;
        #[cfg(evq_kqueue)]
        const ONESHOT = libc::EV_ONESHOT as u32;
        #[cfg(evq_kqueue)]
        const CLEAR = libc::EV_CLEAR as u32;
        #[cfg(evq_kqueue)]
        const EOF = libc::EV_EOF as u32;
        #[cfg(evq_kqueue)]
        const ERROR = libc::EV_ERROR as u32;

        const _ = !0;
    }
}

/// One interest registration or one notification result.
pub struct KEvent<T> {
    ident: usize,
    filter: Filter,
    flags: EventFlags,
    fflags: u32,
    data: i64,
    udata: Option<Arc<T>>,
}

impl<T> KEvent<T> {
    /// The `EV_SET` equivalent. Filter flags and data start at zero and there
    /// is no tag.
    pub fn new(ident: usize, filter: Filter, flags: EventFlags) -> Self {
        Self {
            ident,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: None,
        }
    }

    pub fn with_fflags(mut self, fflags: u32) -> Self {
        self.fflags = fflags;
        self
    }

    pub fn with_data(mut self, data: i64) -> Self {
        self.data = data;
        self
    }

    pub fn with_udata(mut self, udata: Arc<T>) -> Self {
        self.udata = Some(udata);
        self
    }

    pub fn ident(&self) -> usize {
        self.ident
    }

    pub fn filter(&self) -> Filter {
        self.filter
    }

    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    pub fn fflags(&self) -> u32 {
        self.fflags
    }

    pub fn data(&self) -> i64 {
        self.data
    }

    pub fn udata(&self) -> Option<&Arc<T>> {
        self.udata.as_ref()
    }

    pub fn set_ident(&mut self, ident: usize) {
        self.ident = ident;
    }

    pub fn set_filter(&mut self, filter: Filter) {
        self.filter = filter;
    }

    pub fn set_flags(&mut self, flags: EventFlags) {
        self.flags = flags;
    }

    pub fn set_fflags(&mut self, fflags: u32) {
        self.fflags = fflags;
    }

    pub fn set_data(&mut self, data: i64) {
        self.data = data;
    }

    /// Replaces the tag. The previous tag's reference is dropped here, the
    /// new one is held by the record from now on.
    pub fn set_udata(&mut self, udata: Option<Arc<T>>) {
        self.udata = udata;
    }

    pub fn take_udata(&mut self) -> Option<Arc<T>> {
        self.udata.take()
    }

    /// Registration identity as the kernel sees it.
    #[cfg_attr(not(evq_kqueue), allow(dead_code))]
    pub(crate) fn key(&self) -> (usize, Filter) {
        (self.ident, self.filter)
    }
}

impl<T> Clone for KEvent<T> {
    fn clone(&self) -> Self {
        Self {
            ident: self.ident,
            filter: self.filter,
            flags: self.flags,
            fflags: self.fflags,
            data: self.data,
            udata: self.udata.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for KEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KEvent")
            .field("ident", &format_args!("{:#x}", self.ident))
            .field("filter", &self.filter.0)
            .field("flags", &format_args!("{:#x}", self.flags.bits()))
            .field("fflags", &format_args!("{:#x}", self.fflags))
            .field("data", &self.data)
            .field("udata", &self.udata)
            .finish()
    }
}
