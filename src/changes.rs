// src/changes.rs

//! Changelists that arrive as data (config files, the `evq-watch` CLI) rather
//! than as typed Rust values.
//!
//! This is the one place where "not an event record" can be discovered at run
//! time, so it is where [`Error::TypeMismatch`] comes from.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[cfg(evq_epoll)]
use crate::epoll::{EpollChange, EpollFlags, EpollOp};
#[cfg(evq_kqueue)]
use crate::kevent::{EventFlags, Filter, KEvent};

/// A backend-neutral interest registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChangeSpec {
    /// The watched resource, usually a file descriptor.
    pub ident: usize,
    pub readable: bool,
    pub writable: bool,
    pub oneshot: bool,
    /// Edge-triggered (`EPOLLET` / `EV_CLEAR`).
    pub edge: bool,
    /// Remove the registration instead of adding it.
    pub delete: bool,
    pub tag: Option<String>,
}

impl Default for ChangeSpec {
    fn default() -> Self {
        ChangeSpec {
            ident: 0,
            readable: true,
            writable: false,
            oneshot: false,
            edge: false,
            delete: false,
            tag: None,
        }
    }
}

/// Decodes a JSON changelist.
///
/// Accepts an array of records, or a single record object for convenience.
/// Element `i` that is not a record fails with `TypeMismatch { index: i }`.
pub fn parse_changelist(value: &Value) -> Result<Vec<ChangeSpec>> {
    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| parse_change(index, item))
            .collect(),
        Value::Object(_) => Ok(vec![parse_change(0, value)?]),
        Value::Null => Ok(Vec::new()),
        other => Err(Error::TypeMismatch {
            index: 0,
            expected: "an array of event records",
            found: json_kind(other).to_string(),
        }),
    }
}

fn parse_change(index: usize, item: &Value) -> Result<ChangeSpec> {
    if !item.is_object() {
        return Err(Error::TypeMismatch {
            index,
            expected: "an event record object",
            found: json_kind(item).to_string(),
        });
    }
    ChangeSpec::deserialize(item).map_err(|e| Error::TypeMismatch {
        index,
        expected: "an event record object",
        found: e.to_string(),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl ChangeSpec {
    pub fn readable(ident: usize) -> Self {
        ChangeSpec {
            ident,
            ..Default::default()
        }
    }

    #[cfg(evq_epoll)]
    pub fn to_epoll_change(&self) -> EpollChange {
        let op = if self.delete { EpollOp::Del } else { EpollOp::Add };
        let mut events = EpollFlags::empty();
        events.set(EpollFlags::EPOLLIN, self.readable);
        events.set(EpollFlags::EPOLLOUT, self.writable);
        events.set(EpollFlags::EPOLLONESHOT, self.oneshot);
        events.set(EpollFlags::EPOLLET, self.edge);
        EpollChange {
            op,
            fd: self.ident as std::os::unix::io::RawFd,
            events,
        }
    }

    /// One record per filter; kqueue has no combined read/write interest.
    #[cfg(evq_kqueue)]
    pub fn to_kevents(&self) -> Vec<KEvent<String>> {
        let mut flags = if self.delete {
            EventFlags::DELETE
        } else {
            EventFlags::ADD | EventFlags::ENABLE
        };
        flags.set(EventFlags::ONESHOT, self.oneshot && !self.delete);
        flags.set(EventFlags::CLEAR, self.edge && !self.delete);

        let tag = self.tag.clone().map(std::sync::Arc::new);
        [(self.readable, Filter::READ), (self.writable, Filter::WRITE)]
            .into_iter()
            .filter(|(wanted, _)| *wanted)
            .map(|(_, filter)| {
                let mut ev = KEvent::new(self.ident, filter, flags);
                ev.set_udata(tag.clone());
                ev
            })
            .collect()
    }
}
