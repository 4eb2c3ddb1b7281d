// src/main.rs

//! `evq-watch`: registers the configured watches (stdin by default), prints
//! every readiness result as one JSON line, drains readable descriptors and
//! drops a watch once its descriptor reaches end of file.

use anyhow::{Context, Result};
use evq::config::{Config, CONFIG};
use log::{info, warn};
use serde_json::json;
use std::os::unix::io::{BorrowedFd, RawFd};

const DRAIN_BUFFER_SIZE: usize = 4096;

fn main() -> Result<()> {
    // RUST_LOG wins over the configured filter.
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(CONFIG.log_filter.0.as_str()),
    )
    .format_timestamp_micros()
    .init();

    info!("Starting evq-watch...");
    info!("Poll settings: {:?}", CONFIG.poll);

    run(&CONFIG)?;

    info!("evq-watch exited successfully.");
    Ok(())
}

/// Reads and discards what is available on `fd`. Returns the byte count,
/// 0 meaning end of file.
fn drain(fd: RawFd) -> nix::Result<usize> {
    let mut buffer = [0u8; DRAIN_BUFFER_SIZE];
    // The watched descriptor stays open for as long as it is registered.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    nix::unistd::read(fd, &mut buffer)
}

#[cfg(evq_epoll)]
fn run(config: &Config) -> Result<()> {
    use evq::epoll::{Epoll, EpollChange, EpollFlags, EpollOp};
    use std::collections::HashSet;

    let epoll = Epoll::with_size_hint(config.poll.size_hint)
        .context("Failed to create epoll instance")?;
    let watches = config.watch_list().context("Invalid watch list")?;

    let mut pending: Vec<EpollChange> = watches.iter().map(|w| w.to_epoll_change()).collect();
    let mut oneshot: HashSet<RawFd> = HashSet::new();
    let mut remaining: HashSet<RawFd> = HashSet::new();
    for change in &pending {
        match change.op {
            EpollOp::Del => remaining.remove(&change.fd),
            _ => remaining.insert(change.fd),
        };
        if change.events.contains(EpollFlags::EPOLLONESHOT) {
            oneshot.insert(change.fd);
        }
    }
    info!("Watching {} descriptor(s) with epoll_fd {}", remaining.len(), epoll.descriptor());

    while !remaining.is_empty() {
        let events = match epoll.submit_and_wait(&pending, config.poll.max_events, config.poll.timeout()) {
            Ok(events) => events,
            Err(e) if e.is_interrupted() => continue,
            Err(e) => return Err(e).context("epoll wait failed"),
        };
        pending.clear();

        if events.is_empty() {
            info!("Timed out with no descriptor ready, stopping.");
            break;
        }

        for event in events {
            if event.events.contains(EpollFlags::EPOLLERR) {
                warn!("fd {} reported an error condition", event.fd);
            }
            let mut bytes = None;
            if event.events.contains(EpollFlags::EPOLLIN) {
                bytes = Some(drain(event.fd).with_context(|| format!("Failed to read fd {}", event.fd))?);
            }
            println!(
                "{}",
                json!({ "fd": event.fd, "events": event.events, "bytes": bytes })
            );

            let at_eof = bytes == Some(0)
                || (bytes.is_none() && event.events.contains(EpollFlags::EPOLLHUP));
            if at_eof {
                info!("fd {} reached end of file, removing watch", event.fd);
                pending.push(EpollChange {
                    op: EpollOp::Del,
                    fd: event.fd,
                    events: EpollFlags::empty(),
                });
                remaining.remove(&event.fd);
            } else if oneshot.contains(&event.fd) {
                // The kernel disarmed it; nothing more will arrive.
                remaining.remove(&event.fd);
            }
        }
    }
    // Deletes queued by the last round are moot once the instance closes.
    Ok(())
}

#[cfg(all(evq_kqueue, not(evq_epoll)))]
fn run(config: &Config) -> Result<()> {
    use evq::kevent::{EventFlags, KEvent};
    use evq::kqueue::KQueue;
    use std::collections::HashSet;

    let kq: KQueue<String> = KQueue::new().context("Failed to create kqueue instance")?;
    let watches = config.watch_list().context("Invalid watch list")?;

    let mut pending: Vec<KEvent<String>> = watches.iter().flat_map(|w| w.to_kevents()).collect();
    let mut remaining: HashSet<(usize, i32)> = HashSet::new();
    for change in &pending {
        let key = (change.ident(), change.filter().raw());
        if change.flags().contains(EventFlags::DELETE) {
            remaining.remove(&key);
        } else {
            remaining.insert(key);
        }
    }
    info!("Watching {} registration(s) with kqueue_fd {}", remaining.len(), kq.descriptor());

    while !remaining.is_empty() {
        let events = match kq.submit_and_wait(&pending, config.poll.max_events, config.poll.timeout()) {
            Ok(events) => events,
            Err(e) if e.is_interrupted() => continue,
            Err(e) => return Err(e).context("kevent wait failed"),
        };
        pending.clear();

        if events.is_empty() {
            info!("Timed out with no descriptor ready, stopping.");
            break;
        }

        for event in events {
            if event.flags().contains(EventFlags::ERROR) {
                warn!("ident {} reported error {}", event.ident(), event.data());
            }
            let fd = event.ident() as RawFd;
            let key = (event.ident(), event.filter().raw());
            let readable = event.filter() == evq::kevent::Filter::READ;
            let bytes = if readable && event.data() > 0 {
                Some(drain(fd).with_context(|| format!("Failed to read fd {}", fd))?)
            } else {
                None
            };
            println!(
                "{}",
                json!({
                    "ident": event.ident(),
                    "filter": event.filter(),
                    "flags": event.flags(),
                    "data": event.data(),
                    "tag": event.udata().map(|t| t.as_str()),
                    "bytes": bytes,
                })
            );

            if event.flags().contains(EventFlags::EOF) && event.data() == 0 {
                info!("ident {} reached end of file, removing watch", event.ident());
                pending.push(KEvent::new(event.ident(), event.filter(), EventFlags::DELETE));
                remaining.remove(&key);
            } else if event.flags().contains(EventFlags::ONESHOT) {
                remaining.remove(&key);
            }
        }
    }
    Ok(())
}

#[cfg(not(any(evq_epoll, evq_kqueue)))]
fn run(_config: &Config) -> Result<()> {
    warn!("No readiness backend was compiled for this target.");
    anyhow::bail!("evq-watch needs the epoll or kqueue backend")
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use std::fs::File;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    #[test_log::test]
    fn drain_reads_pending_bytes_then_eof() {
        let (read_end, write_end) = pipe().unwrap();
        let mut writer = File::from(write_end);
        writer.write_all(b"hello").unwrap();

        assert_eq!(drain(read_end.as_raw_fd()).unwrap(), 5);
        drop(writer);
        assert_eq!(drain(read_end.as_raw_fd()).unwrap(), 0);
    }
}
