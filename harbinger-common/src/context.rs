//! Message context borrowed from the MTA for the duration of a hook call.
//!
//! The MTA owns every [`MessageContext`] it hands to a hook; the delivery
//! pipeline must not retain references past the hook return. Anything that
//! outlives the call (retry-cache entries, bounces) is either serialized to
//! disk or built in a fresh context obtained from the host pool.

use std::{str::FromStr, sync::Arc};

/// Direction of a message relative to the local system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundType {
    /// Arrived from a remote MTA.
    In,
    /// Submitted by a local client for outbound transport.
    Out,
    /// Passing through on behalf of another system.
    Relay,
    /// Already classified as not locally deliverable.
    NotLocal,
    /// Created by an application (bounces, auto-replies).
    App,
}

impl BoundType {
    /// Stable token used by line-oriented metadata files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
            Self::Relay => "relay",
            Self::NotLocal => "notlocal",
            Self::App => "app",
        }
    }
}

impl FromStr for BoundType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            "relay" => Ok(Self::Relay),
            "notlocal" => Ok(Self::NotLocal),
            "app" => Ok(Self::App),
            _ => Err(()),
        }
    }
}

/// Replayable recipient stream, one address per line.
///
/// Hooks consume the stream and may overwrite it wholesale (the local
/// delivery hook rewrites it to the not-yet-handled remainder).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientList {
    lines: Vec<String>,
}

impl RecipientList {
    #[must_use]
    pub const fn new() -> Self {
        Self { lines: Vec::new() }
    }

    /// Append one address line.
    pub fn write_line(&mut self, address: impl Into<String>) {
        self.lines.push(address.into());
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl FromIterator<String> for RecipientList {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            lines: iter.into_iter().collect(),
        }
    }
}

/// Raw RFC-822 message view. Cloning is cheap; the bytes are shared.
#[derive(Debug, Clone, Default)]
pub struct Mail {
    data: Arc<[u8]>,
}

impl Mail {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when any line of the message begins with a dot.
    pub fn has_dot_lines(&self) -> bool {
        self.split_lines().any(|line| line.first() == Some(&b'.'))
    }

    /// Produce a copy with SMTP dot transparency undone: one leading dot is
    /// removed from every dot-prefixed line. The original view is untouched.
    #[must_use]
    pub fn transfer_dot(&self) -> Self {
        let mut out = Vec::with_capacity(self.data.len());
        let mut rest: &[u8] = &self.data;
        while !rest.is_empty() {
            let end = rest
                .iter()
                .position(|&b| b == b'\n')
                .map_or(rest.len(), |i| i + 1);
            let line = &rest[..end];
            if line.first() == Some(&b'.') {
                out.extend_from_slice(&line[1..]);
            } else {
                out.extend_from_slice(line);
            }
            rest = &rest[end..];
        }
        Self::new(out)
    }

    fn split_lines(&self) -> impl Iterator<Item = &[u8]> {
        self.data.split(|&b| b == b'\n')
    }
}

/// Envelope control block attached to a message in the MTA queue.
#[derive(Debug, Clone)]
pub struct MessageControl {
    pub bound_type: BoundType,
    /// Envelope sender. `none@none` marks system mail that must never bounce.
    pub from: String,
    pub rcpt_to: RecipientList,
    /// False for system-generated mail (bounces, auto-replies).
    pub need_bounce: bool,
    pub queue_id: u32,
}

impl Default for MessageControl {
    fn default() -> Self {
        Self {
            bound_type: BoundType::In,
            from: String::new(),
            rcpt_to: RecipientList::new(),
            need_bounce: true,
            queue_id: 0,
        }
    }
}

/// A queued message together with its envelope control block.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    pub control: MessageControl,
    pub mail: Mail,
}
