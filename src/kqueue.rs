// src/kqueue.rs

//! Backend B: a wrapper around BSD/macOS `kqueue`/`kevent`.
//!
//! Records are [`KEvent`]s carrying an optional `Arc<T>` user tag. The kernel
//! only ever sees a token for that tag (see [`crate::tags`]), so a tag stays
//! alive exactly as long as a registration might still report it: until it is
//! deleted, fires with `EV_ONESHOT`, is re-added with another tag, or the
//! queue is dropped.

use crate::error::{Error, Result};
use crate::kevent::{EventFlags, Filter, KEvent};
use crate::tags::{TagTable, NO_TAG};
use crate::timeout;
use bitflags::bitflags;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

bitflags! {
    /// `fflags` for `EVFILT_READ` / `EVFILT_WRITE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ReadWriteNotes: u32 {
        const LOWAT = libc::NOTE_LOWAT as u32;

        const _ = !0;
    }
}

bitflags! {
    /// `fflags` for `EVFILT_VNODE`: what happened to the file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct VnodeNotes: u32 {
        const DELETE = libc::NOTE_DELETE as u32;
        const WRITE = libc::NOTE_WRITE as u32;
        const EXTEND = libc::NOTE_EXTEND as u32;
        const ATTRIB = libc::NOTE_ATTRIB as u32;
        const LINK = libc::NOTE_LINK as u32;
        const RENAME = libc::NOTE_RENAME as u32;
        const REVOKE = libc::NOTE_REVOKE as u32;

        const _ = !0;
    }
}

bitflags! {
    /// `fflags` for `EVFILT_PROC`: process lifecycle events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ProcNotes: u32 {
        const EXIT = libc::NOTE_EXIT as u32;
        const FORK = libc::NOTE_FORK as u32;
        const EXEC = libc::NOTE_EXEC as u32;
        #[cfg(not(any(target_os = "macos", target_os = "ios")))]
        const TRACK = libc::NOTE_TRACK as u32;
        #[cfg(not(any(target_os = "macos", target_os = "ios")))]
        const TRACKERR = libc::NOTE_TRACKERR as u32;
        #[cfg(not(any(target_os = "macos", target_os = "ios")))]
        const CHILD = libc::NOTE_CHILD as u32;

        const _ = !0;
    }
}

/// A result of the deprecated batch call: the scalar fields, no tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawKEvent {
    pub ident: usize,
    pub filter: Filter,
    pub flags: EventFlags,
    pub fflags: u32,
    pub data: i64,
}

fn to_libc_kevent<T>(ev: &KEvent<T>, token: usize) -> libc::kevent {
    let mut kev: libc::kevent = unsafe { std::mem::zeroed() };
    kev.ident = ev.ident() as _;
    kev.filter = ev.filter().raw() as _;
    kev.flags = ev.flags().bits() as _;
    kev.fflags = ev.fflags() as _;
    kev.data = ev.data() as _;
    kev.udata = token as _;
    kev
}

fn raw_fields(kev: &libc::kevent) -> RawKEvent {
    RawKEvent {
        ident: kev.ident as usize,
        filter: Filter(kev.filter as i32),
        flags: EventFlags::from_bits_retain(kev.flags as u32),
        fflags: kev.fflags as u32,
        data: kev.data as i64,
    }
}

/// Owns one kqueue descriptor and the tags of its live registrations.
pub struct KQueue<T> {
    kqueue_fd: RawFd,
    tags: Mutex<TagTable<T>>,
}

impl<T> KQueue<T> {
    pub fn new() -> Result<Self> {
        let kqueue_fd = unsafe { libc::kqueue() };
        if kqueue_fd == -1 {
            return Err(Error::resource_from_last_os("kqueue instance"));
        }
        // kqueue descriptors are not inherited across fork, but they are
        // across exec unless marked.
        if unsafe { libc::fcntl(kqueue_fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            warn!(
                "Failed to set FD_CLOEXEC on kqueue_fd {}: {}",
                kqueue_fd,
                io::Error::last_os_error()
            );
        }
        debug!("KQueue created with kqueue_fd: {}", kqueue_fd);
        Ok(Self {
            kqueue_fd,
            tags: Mutex::new(TagTable::new()),
        })
    }

    /// The raw descriptor, for embedding in another multiplexer.
    pub fn descriptor(&self) -> RawFd {
        self.kqueue_fd
    }

    /// Number of user tags currently kept alive for live registrations.
    pub fn live_tags(&self) -> usize {
        self.tags().live()
    }

    fn tags(&self) -> MutexGuard<'_, TagTable<T>> {
        // The table has no invariants a panicking holder could break halfway.
        self.tags.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Submits a single change.
    ///
    /// `EV_ADD` takes a reference to the record's tag, `EV_DELETE` releases
    /// the registration's tag. The table lock is held across the (non
    /// blocking) syscall so the table and the kernel agree on ordering.
    pub fn register(&self, change: &KEvent<T>) -> Result<()> {
        let (ident, filter) = change.key();
        let flags = change.flags();
        let mut tags = self.tags();
        let mut displaced = None;

        let token = if flags.contains(EventFlags::DELETE) {
            NO_TAG
        } else if flags.contains(EventFlags::ADD) {
            displaced = Some(tags.displaced(ident, filter));
            tags.hold(ident, filter, change.udata())
        } else {
            // Without EV_ADD the kernel keeps the registration's udata.
            tags.current_token(ident, filter)
        };

        let kev = to_libc_kevent(change, token);
        let ret = unsafe {
            libc::kevent(
                self.kqueue_fd,
                &kev,
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if ret == -1 {
            let err = Error::last_os("kevent");
            if let Some(displaced) = displaced {
                // The kernel kept whatever registration existed before.
                tags.restore(displaced);
            }
            trace!(
                "kevent change ident {} filter {} flags {:#x} on kqueue_fd {} failed: {}",
                ident,
                filter.raw(),
                flags.bits(),
                self.kqueue_fd,
                err
            );
            return Err(err);
        }

        if flags.contains(EventFlags::DELETE) {
            drop(tags.release(ident, filter));
        }
        trace!(
            "kevent change ident {} filter {} flags {:#x} token {:#x} on kqueue_fd {}",
            ident,
            filter.raw(),
            flags.bits(),
            token,
            self.kqueue_fd
        );
        Ok(())
    }

    /// Submits `changes` one at a time, then waits for up to `max_results`
    /// results.
    ///
    /// The first failing change aborts the call and leaves the rest
    /// unsubmitted. `max_results == 0` skips the wait entirely. The table lock
    /// is not held while blocked in the kernel.
    pub fn submit_and_wait(
        &self,
        changes: &[KEvent<T>],
        max_results: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<KEvent<T>>> {
        for (i, change) in changes.iter().enumerate() {
            if let Err(err) = self.register(change) {
                debug!(
                    "KQueue: change {} of {} failed, {} left unsubmitted: {}",
                    i,
                    changes.len(),
                    changes.len() - i - 1,
                    err
                );
                return Err(err);
            }
        }

        if max_results == 0 {
            trace!("KQueue: zero results requested, skipping kevent wait");
            return Ok(Vec::new());
        }
        let max_results = max_results.min(libc::c_int::MAX as usize);

        let mut buffer: Vec<libc::kevent> = Vec::new();
        buffer
            .try_reserve_exact(max_results)
            .map_err(|_| Error::Resource {
                what: "kevent result buffer",
                errno: None,
            })?;

        let ts = timeout::to_timespec(timeout);
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);
        trace!(
            "KQueue: waiting for up to {} events with timeout {:?} on kqueue_fd {}",
            max_results,
            timeout,
            self.kqueue_fd
        );

        let nev = unsafe {
            libc::kevent(
                self.kqueue_fd,
                std::ptr::null(),
                0,
                buffer.as_mut_ptr(),
                max_results as _,
                ts_ptr,
            )
        };
        if nev == -1 {
            return Err(Error::last_os("kevent"));
        }
        // The kernel initialised the first `nev` entries.
        unsafe { buffer.set_len(nev as usize) };
        trace!("kevent returned {} events", nev);

        let mut tags = self.tags();
        let results = buffer
            .iter()
            .map(|kev| {
                let fields = raw_fields(kev);
                let token = kev.udata as usize;
                let tag = tags.resolve(token);
                if fields.flags.contains(EventFlags::ONESHOT) {
                    // The kernel already dropped the registration.
                    drop(tags.release_token(token));
                }
                let mut ev = KEvent::new(fields.ident, fields.filter, fields.flags)
                    .with_fflags(fields.fflags)
                    .with_data(fields.data);
                ev.set_udata(tag);
                ev
            })
            .collect();
        Ok(results)
    }

    /// The old batch-style call: the whole changelist goes to the kernel in
    /// one `kevent`, the timeout is integer milliseconds, and results carry no
    /// tag. Tags on `changes` are ignored.
    ///
    /// An `EV_ADD` or `EV_DELETE` sent here leaves the kernel without a token
    /// for that registration, so once the call succeeds the tag previously
    /// held for it is released. A change the kernel reports back with
    /// `EV_ERROR` keeps its tag. If the call fails outright nothing is
    /// released, as it is unknown which changes were applied.
    #[deprecated(note = "use `submit_and_wait`, which keeps user tags alive")]
    pub fn kevent_batch(
        &self,
        changes: &[KEvent<T>],
        max_results: usize,
        timeout_ms: i64,
    ) -> Result<Vec<RawKEvent>> {
        let changelist: Vec<libc::kevent> = changes
            .iter()
            .map(|change| to_libc_kevent(change, NO_TAG))
            .collect();
        // Tokens, not keys: a concurrent `register` of the same key while this
        // call blocks moves its slot to a new generation and is left alone.
        let superseded: Vec<((usize, Filter), usize)> = {
            let tags = self.tags();
            changes
                .iter()
                .filter(|change| {
                    change
                        .flags()
                        .intersects(EventFlags::ADD | EventFlags::DELETE)
                })
                .map(|change| {
                    let (ident, filter) = change.key();
                    ((ident, filter), tags.current_token(ident, filter))
                })
                .filter(|&(_, token)| token != NO_TAG)
                .collect()
        };
        let max_results = max_results.min(libc::c_int::MAX as usize);

        let mut buffer: Vec<libc::kevent> = Vec::new();
        buffer
            .try_reserve_exact(max_results)
            .map_err(|_| Error::Resource {
                what: "kevent result buffer",
                errno: None,
            })?;
        let ts = timeout::legacy_millis_to_timespec(timeout_ms)?;

        let nev = unsafe {
            libc::kevent(
                self.kqueue_fd,
                changelist.as_ptr(),
                changelist.len() as _,
                buffer.as_mut_ptr(),
                max_results as _,
                &ts,
            )
        };
        if nev == -1 {
            return Err(Error::last_os("kevent"));
        }
        unsafe { buffer.set_len(nev as usize) };

        let results: Vec<RawKEvent> = buffer.iter().map(raw_fields).collect();
        let mut tags = self.tags();
        for (key, token) in superseded {
            let rejected = results.iter().any(|ev| {
                ev.flags.contains(EventFlags::ERROR) && (ev.ident, ev.filter) == key
            });
            if !rejected {
                drop(tags.release_token(token));
            }
        }
        for (ev, kev) in results.iter().zip(&buffer) {
            if ev.flags.contains(EventFlags::ONESHOT) && !ev.flags.contains(EventFlags::ERROR) {
                drop(tags.release_token(kev.udata as usize));
            }
        }
        Ok(results)
    }
}

impl<T> AsRawFd for KQueue<T> {
    fn as_raw_fd(&self) -> RawFd {
        self.kqueue_fd
    }
}

impl<T> AsFd for KQueue<T> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.kqueue_fd) }
    }
}

impl<T> std::fmt::Debug for KQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KQueue")
            .field("kqueue_fd", &self.kqueue_fd)
            .field("live_tags", &self.live_tags())
            .finish()
    }
}

impl<T> Drop for KQueue<T> {
    fn drop(&mut self) {
        if unsafe { libc::close(self.kqueue_fd) } == -1 {
            warn!(
                "Failed to close kqueue_fd {} in KQueue::drop: {}",
                self.kqueue_fd,
                io::Error::last_os_error()
            );
        } else {
            debug!("Closed kqueue_fd {} in KQueue::drop", self.kqueue_fd);
        }
        // Every registration died with the descriptor.
        self.tags().clear();
    }
}

