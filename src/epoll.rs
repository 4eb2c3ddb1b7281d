// src/epoll.rs

//! Backend A: a thin wrapper around Linux `epoll` using raw `libc` calls.
//!
//! The watched file descriptor is stored as the event's data word, so every
//! result comes back as `(triggered_mask, watched_fd)`. Nothing here buffers,
//! retries or interprets events; the kernel does the work.

use crate::error::{Error, Result};
use crate::timeout;
use bitflags::bitflags;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

const EPOLL_CREATE_CLOEXEC: libc::c_int = libc::EPOLL_CLOEXEC;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum EpollOp {
    Add = libc::EPOLL_CTL_ADD,
    Mod = libc::EPOLL_CTL_MOD,
    Del = libc::EPOLL_CTL_DEL,
}

bitflags! {
    /// Interest and result bits. Unknown bits reported by the kernel are kept.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct EpollFlags: u32 {
        const EPOLLIN = libc::EPOLLIN as u32;
        const EPOLLOUT = libc::EPOLLOUT as u32;
        const EPOLLPRI = libc::EPOLLPRI as u32;
        const EPOLLERR = libc::EPOLLERR as u32;
        const EPOLLHUP = libc::EPOLLHUP as u32;
        const EPOLLRDHUP = libc::EPOLLRDHUP as u32;
        const EPOLLET = libc::EPOLLET as u32;
        const EPOLLONESHOT = libc::EPOLLONESHOT as u32;

        const _ = !0;
    }
}

/// One readiness result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpollEvent {
    pub events: EpollFlags,
    pub fd: RawFd,
}

impl EpollEvent {
    pub fn as_tuple(&self) -> (EpollFlags, RawFd) {
        (self.events, self.fd)
    }

    fn from_raw(raw: &libc::epoll_event) -> Self {
        // Copy out of the packed struct before use.
        let events = raw.events;
        let data = raw.u64;
        Self {
            events: EpollFlags::from_bits_retain(events),
            fd: data as RawFd,
        }
    }
}

/// One entry of a changelist passed to [`Epoll::submit_and_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpollChange {
    pub op: EpollOp,
    pub fd: RawFd,
    pub events: EpollFlags,
}

fn new_libc_epoll_event(flags: EpollFlags, fd: RawFd) -> libc::epoll_event {
    libc::epoll_event {
        events: flags.bits(),
        u64: fd as u64,
    }
}

/// Owns one epoll instance. The descriptor is closed exactly once, on drop.
#[derive(Debug)]
pub struct Epoll {
    epoll_fd: RawFd,
}

impl Epoll {
    pub fn new() -> Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(EPOLL_CREATE_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(Error::resource_from_last_os("epoll instance"));
        }
        debug!("Epoll created with epoll_fd: {}", epoll_fd);
        Ok(Self { epoll_fd })
    }

    /// The legacy `epoll_create(size)` entry point. Modern kernels ignore the
    /// hint but still reject `size <= 0`.
    pub fn with_size_hint(size: i32) -> Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create(size) };
        if epoll_fd == -1 {
            return Err(Error::resource_from_last_os("epoll instance"));
        }
        set_cloexec(epoll_fd);
        debug!(
            "Epoll created with epoll_fd: {} (size hint {})",
            epoll_fd, size
        );
        Ok(Self { epoll_fd })
    }

    /// The raw descriptor, for embedding in another multiplexer.
    pub fn descriptor(&self) -> RawFd {
        self.epoll_fd
    }

    pub fn control(&self, op: EpollOp, fd: RawFd, events: EpollFlags) -> Result<()> {
        let mut event = new_libc_epoll_event(events, fd);
        if unsafe { libc::epoll_ctl(self.epoll_fd, op as libc::c_int, fd, &mut event) } == -1 {
            let err = Error::last_os("epoll_ctl");
            trace!(
                "epoll_ctl({:?}) of fd {} on epoll_fd {} failed: {}",
                op,
                fd,
                self.epoll_fd,
                err
            );
            return Err(err);
        }
        trace!(
            "epoll_ctl({:?}) fd {} on epoll_fd {} with flags {:?}",
            op,
            fd,
            self.epoll_fd,
            events
        );
        Ok(())
    }

    pub fn add(&self, fd: RawFd, events: EpollFlags) -> Result<()> {
        self.control(EpollOp::Add, fd, events)
    }

    pub fn modify(&self, fd: RawFd, events: EpollFlags) -> Result<()> {
        self.control(EpollOp::Mod, fd, events)
    }

    pub fn delete(&self, fd: RawFd) -> Result<()> {
        self.control(EpollOp::Del, fd, EpollFlags::empty())
    }

    /// Waits for up to `max_events` results.
    ///
    /// `max_events == 0` returns immediately without entering the kernel.
    /// Any failure, including `EINTR`, is returned to the caller.
    pub fn wait(&self, max_events: usize, timeout: Option<Duration>) -> Result<Vec<EpollEvent>> {
        if max_events == 0 {
            trace!("Epoll: zero results requested, skipping epoll_wait");
            return Ok(Vec::new());
        }
        let max_events = max_events.min(libc::c_int::MAX as usize);

        let mut buffer: Vec<libc::epoll_event> = Vec::new();
        buffer
            .try_reserve_exact(max_events)
            .map_err(|_| Error::Resource {
                what: "epoll result buffer",
                errno: None,
            })?;

        let timeout_ms = timeout::to_epoll_millis(timeout);
        trace!(
            "Epoll: waiting for up to {} events with timeout {}ms on epoll_fd {}",
            max_events,
            timeout_ms,
            self.epoll_fd
        );

        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                buffer.as_mut_ptr(),
                max_events as libc::c_int,
                timeout_ms,
            )
        };
        if num_events == -1 {
            return Err(Error::last_os("epoll_wait"));
        }
        // The kernel initialised the first `num_events` entries.
        unsafe { buffer.set_len(num_events as usize) };

        trace!(
            "Epoll: epoll_wait on fd {} returned {} events",
            self.epoll_fd,
            num_events
        );
        Ok(buffer.iter().map(EpollEvent::from_raw).collect())
    }

    /// Applies `changes` one `epoll_ctl` at a time, then waits.
    ///
    /// The first failing change aborts the call; later changes are not
    /// submitted and no wait happens.
    pub fn submit_and_wait(
        &self,
        changes: &[EpollChange],
        max_events: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<EpollEvent>> {
        for (i, change) in changes.iter().enumerate() {
            if let Err(err) = self.control(change.op, change.fd, change.events) {
                debug!(
                    "Epoll: change {} of {} failed, {} left unsubmitted: {}",
                    i,
                    changes.len(),
                    changes.len() - i - 1,
                    err
                );
                return Err(err);
            }
        }
        self.wait(max_events, timeout)
    }
}

fn set_cloexec(fd: RawFd) {
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
        warn!(
            "Failed to set FD_CLOEXEC on epoll_fd {}: {}",
            fd,
            io::Error::last_os_error()
        );
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll_fd
    }
}

impl AsFd for Epoll {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // The descriptor stays open for as long as `self` is borrowed.
        unsafe { BorrowedFd::borrow_raw(self.epoll_fd) }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        if unsafe { libc::close(self.epoll_fd) } == -1 {
            warn!(
                "Failed to close epoll_fd {} in Epoll::drop: {}",
                self.epoll_fd,
                io::Error::last_os_error()
            );
        } else {
            debug!("Closed epoll_fd {} in Epoll::drop", self.epoll_fd);
        }
    }
}
