// src/kqueue_tests.rs

#![cfg(test)]

use super::kevent::{EventFlags, Filter, KEvent};
use super::kqueue::KQueue;
use crate::error::Error;
use nix::errno::Errno;
use nix::unistd::pipe;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

fn make_pipe() -> (OwnedFd, File) {
    let (read_end, write_end) = pipe().expect("pipe() failed");
    (read_end, File::from(write_end))
}

fn read_interest<T>(fd: &OwnedFd, extra: EventFlags) -> KEvent<T> {
    KEvent::new(
        fd.as_raw_fd() as usize,
        Filter::READ,
        EventFlags::ADD | EventFlags::ENABLE | extra,
    )
}

fn assert_errno(result: crate::Result<impl std::fmt::Debug>, expected: Errno) {
    match result {
        Err(Error::Kernel { errno, .. }) => assert_eq!(errno, expected),
        other => panic!("expected Kernel error {:?}, got {:?}", expected, other),
    }
}

#[test_log::test]
fn test_create_and_release_does_not_leak() {
    for _ in 0..1000 {
        let kq: KQueue<()> = KQueue::new().expect("KQueue::new failed");
        assert!(kq.descriptor() >= 0);
    }
}

#[test_log::test]
fn test_zero_results_skip_the_wait() {
    let kq: KQueue<()> = KQueue::new().unwrap();
    let start = Instant::now();
    assert!(kq.submit_and_wait(&[], 0, None).unwrap().is_empty());
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test_log::test]
fn test_zero_timeout_with_nothing_ready_is_empty() {
    let kq: KQueue<()> = KQueue::new().unwrap();
    let (read_end, _write_end) = make_pipe();
    let events = kq
        .submit_and_wait(
            &[read_interest(&read_end, EventFlags::empty())],
            8,
            Some(Duration::ZERO),
        )
        .unwrap();
    assert!(events.is_empty());
}

#[test_log::test]
fn test_pipe_becomes_readable_and_echoes_tag() {
    let kq = KQueue::new().unwrap();
    let (read_end, mut write_end) = make_pipe();
    let tag = Arc::new("reader".to_string());

    kq.register(&read_interest(&read_end, EventFlags::empty()).with_udata(tag.clone()))
        .unwrap();
    write_end.write_all(b"x").unwrap();

    let events = kq.submit_and_wait(&[], 8, Some(WAIT_TIMEOUT)).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].ident(), read_end.as_raw_fd() as usize);
    assert_eq!(events[0].filter(), Filter::READ);
    assert_eq!(events[0].data(), 1); // bytes available
    assert!(Arc::ptr_eq(events[0].udata().unwrap(), &tag));
}

#[test_log::test]
fn test_oneshot_result_releases_the_tag() {
    let kq = KQueue::new().unwrap();
    let (read_end, mut write_end) = make_pipe();
    let tag = Arc::new(7u32);

    kq.register(&read_interest(&read_end, EventFlags::ONESHOT).with_udata(tag.clone()))
        .unwrap();
    assert_eq!(Arc::strong_count(&tag), 2);
    assert_eq!(kq.live_tags(), 1);

    write_end.write_all(b"x").unwrap();
    let events = kq.submit_and_wait(&[], 8, Some(WAIT_TIMEOUT)).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(kq.live_tags(), 0);

    // Only the caller and the returned record hold it now.
    assert_eq!(Arc::strong_count(&tag), 2);
    drop(events);
    assert_eq!(Arc::strong_count(&tag), 1);
}

#[test_log::test]
fn test_delete_releases_the_tag() {
    let kq = KQueue::new().unwrap();
    let (read_end, _write_end) = make_pipe();
    let tag = Arc::new(());

    kq.register(&read_interest(&read_end, EventFlags::empty()).with_udata(tag.clone()))
        .unwrap();
    assert_eq!(Arc::strong_count(&tag), 2);

    let delete = KEvent::new(
        read_end.as_raw_fd() as usize,
        Filter::READ,
        EventFlags::DELETE,
    );
    kq.register(&delete).unwrap();
    assert_eq!(Arc::strong_count(&tag), 1);
    assert_errno(kq.register(&delete), Errno::ENOENT);
}

#[test_log::test]
fn test_drop_releases_every_tag() {
    let tag = Arc::new(());
    let (read_end, _write_end) = make_pipe();
    {
        let kq = KQueue::new().unwrap();
        kq.register(&read_interest(&read_end, EventFlags::empty()).with_udata(tag.clone()))
            .unwrap();
        assert_eq!(Arc::strong_count(&tag), 2);
    }
    assert_eq!(Arc::strong_count(&tag), 1);
}

#[test_log::test]
fn test_invalid_filter_is_a_kernel_error() {
    let kq: KQueue<()> = KQueue::new().unwrap();
    let bogus = KEvent::new(0, Filter(-100), EventFlags::ADD);
    assert_errno(kq.register(&bogus), Errno::EINVAL);
}

#[test_log::test]
fn test_failed_add_does_not_keep_the_tag() {
    let kq = KQueue::new().unwrap();
    let tag = Arc::new(());
    let bad_fd = KEvent::new(usize::MAX >> 1, Filter::READ, EventFlags::ADD).with_udata(tag.clone());
    assert_errno(kq.register(&bad_fd), Errno::EBADF);
    assert_eq!(Arc::strong_count(&tag), 1);
    assert_eq!(kq.live_tags(), 0);
}

#[test_log::test]
fn test_submit_stops_at_first_failing_change() {
    let kq: KQueue<()> = KQueue::new().unwrap();
    let (r1, mut w1) = make_pipe();
    let (r2, mut w2) = make_pipe();

    let changes = [
        read_interest(&r1, EventFlags::empty()),
        KEvent::new(0, Filter(-100), EventFlags::ADD),
        read_interest(&r2, EventFlags::empty()),
    ];
    assert_errno(
        kq.submit_and_wait(&changes, 8, Some(Duration::ZERO)),
        Errno::EINVAL,
    );

    w1.write_all(b"1").unwrap();
    w2.write_all(b"2").unwrap();
    let events = kq.submit_and_wait(&[], 8, Some(WAIT_TIMEOUT)).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].ident(), r1.as_raw_fd() as usize);
}

#[test_log::test]
fn test_oneshot_timer_fires_once() {
    let kq = KQueue::new().unwrap();
    let tag = Arc::new("tick");
    let timer = KEvent::new(1, Filter::TIMER, EventFlags::ADD | EventFlags::ONESHOT)
        .with_data(10) // milliseconds
        .with_udata(tag.clone());

    let events = kq.submit_and_wait(&[timer], 4, Some(WAIT_TIMEOUT)).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].filter(), Filter::TIMER);
    assert_eq!(**events[0].udata().unwrap(), "tick");
    assert_eq!(kq.live_tags(), 0);

    assert!(kq
        .submit_and_wait(&[], 4, Some(Duration::from_millis(50)))
        .unwrap()
        .is_empty());
}

#[test_log::test]
#[allow(deprecated)]
fn test_legacy_batch_call() {
    let kq: KQueue<()> = KQueue::new().unwrap();
    let (r1, mut w1) = make_pipe();
    let (r2, mut w2) = make_pipe();
    w1.write_all(b"a").unwrap();
    w2.write_all(b"bb").unwrap();

    let changes = [
        read_interest(&r1, EventFlags::empty()),
        read_interest(&r2, EventFlags::empty()),
    ];
    let mut events = kq.kevent_batch(&changes, 8, 1500).unwrap();
    events.sort_by_key(|ev| ev.ident);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].data + events[1].data, 3);
    assert!(matches!(
        kq.kevent_batch(&[], 1, -1),
        Err(Error::InvalidTimeout(_))
    ));
}

#[test_log::test]
fn test_rejected_re_add_keeps_the_live_tag() {
    let kq = KQueue::new().unwrap();
    let first = Arc::new("first");
    let second = Arc::new("second");
    let timer = KEvent::new(2, Filter::TIMER, EventFlags::ADD | EventFlags::ONESHOT)
        .with_data(20)
        .with_udata(first.clone());
    kq.register(&timer).unwrap();

    // A negative period is refused, so the first registration stays armed.
    let bad = KEvent::new(2, Filter::TIMER, EventFlags::ADD | EventFlags::ONESHOT)
        .with_data(-1)
        .with_udata(second.clone());
    assert!(matches!(kq.register(&bad), Err(Error::Kernel { .. })));
    assert_eq!(Arc::strong_count(&second), 1);
    assert_eq!(kq.live_tags(), 1);

    let events = kq.submit_and_wait(&[], 4, Some(WAIT_TIMEOUT)).unwrap();
    assert_eq!(events.len(), 1);
    assert!(Arc::ptr_eq(events[0].udata().unwrap(), &first));
    assert_eq!(kq.live_tags(), 0);
}

#[test_log::test]
#[allow(deprecated)]
fn test_legacy_batch_delete_releases_the_tag() {
    let kq = KQueue::new().unwrap();
    let (read_end, _write_end) = make_pipe();
    let tag = Arc::new("pipe");
    kq.register(&read_interest(&read_end, EventFlags::empty()).with_udata(tag.clone()))
        .unwrap();
    assert_eq!(Arc::strong_count(&tag), 2);

    let delete = KEvent::new(read_end.as_raw_fd() as usize, Filter::READ, EventFlags::DELETE);
    assert!(kq.kevent_batch(&[delete], 0, 0).unwrap().is_empty());
    assert_eq!(kq.live_tags(), 0);
    assert_eq!(Arc::strong_count(&tag), 1);
}

#[test_log::test]
#[allow(deprecated)]
fn test_legacy_batch_re_add_releases_the_tag() {
    let kq = KQueue::new().unwrap();
    let (read_end, mut write_end) = make_pipe();
    let tag = Arc::new("pipe");
    kq.register(&read_interest(&read_end, EventFlags::empty()).with_udata(tag.clone()))
        .unwrap();

    kq.kevent_batch(&[read_interest(&read_end, EventFlags::empty())], 0, 0)
        .unwrap();
    assert_eq!(kq.live_tags(), 0);
    assert_eq!(Arc::strong_count(&tag), 1);

    // The registration itself is still live, now untagged.
    write_end.write_all(b"x").unwrap();
    let events = kq.submit_and_wait(&[], 4, Some(WAIT_TIMEOUT)).unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].udata().is_none());
}

#[test_log::test]
#[allow(deprecated)]
fn test_legacy_batch_oneshot_result_releases_the_tag() {
    let kq = KQueue::new().unwrap();
    let tag = Arc::new("tick");
    let timer = KEvent::new(3, Filter::TIMER, EventFlags::ADD | EventFlags::ONESHOT)
        .with_data(10)
        .with_udata(tag.clone());
    kq.register(&timer).unwrap();

    let events = kq.kevent_batch(&[], 4, 5000).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(kq.live_tags(), 0);
    assert_eq!(Arc::strong_count(&tag), 1);
}
