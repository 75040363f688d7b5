//! Tracked resource keys and caller priorities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A trackable resource, e.g. a connection 3-tuple.
///
/// The fields are opaque to the controller; two entries are the same slot
/// when all three fields are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entry {
    pub protocol: String,
    pub local_addr: String,
    pub remote_addr: String,
}

impl Entry {
    pub fn new(
        protocol: impl Into<String>,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            local_addr: local_addr.into(),
            remote_addr: remote_addr.into(),
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}->{}", self.protocol, self.local_addr, self.remote_addr)
    }
}

/// Admission precedence. Higher values win.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const MIN: Priority = Priority(i32::MIN);
    pub const MAX: Priority = Priority(i32::MAX);
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_equality_is_structural() {
        let a = Entry::new("udp", "10.0.0.1:53", "8.8.8.8:53");
        let b = Entry::new("udp".to_string(), "10.0.0.1:53", "8.8.8.8:53");
        assert_eq!(a, b);
        assert_ne!(a, Entry::new("tcp", "10.0.0.1:53", "8.8.8.8:53"));
    }

    #[test]
    fn entry_display() {
        let e = Entry::new("udp", "10.0.0.1:6881", "1.2.3.4:6881");
        assert_eq!(e.to_string(), "udp 10.0.0.1:6881->1.2.3.4:6881");
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::MAX > Priority::default());
        assert!(Priority::MIN < Priority(-1));
        assert_eq!(Priority::default(), Priority(0));
    }

    #[test]
    fn priority_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&Priority(-7)).unwrap(), "-7");
    }
}
