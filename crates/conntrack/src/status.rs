//! Point-in-time view of an [`Instance`](crate::Instance) for diagnostics.
//!
//! The text rendering is for humans; its layout is not stable.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::entry::Entry;
use crate::instance::State;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// Distinct occupied entries.
    pub num_entries: usize,
    pub num_waiters: usize,
    pub waiters_by_reason: Vec<ReasonCount>,
    pub handles: Vec<HandleStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReasonCount {
    pub reason: String,
    pub waiters: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandleStatus {
    pub entry: Entry,
    pub reason: String,
    /// `None` until the handle is released. Zero once the linger has run out
    /// but the removal has not landed yet; `Duration::MAX` if it never runs out.
    #[serde(rename = "expires_in_ms", serialize_with = "millis::option")]
    pub expires_in: Option<Duration>,
    #[serde(rename = "age_ms", serialize_with = "millis::duration")]
    pub age: Duration,
}

impl StatusSnapshot {
    pub(crate) fn capture(state: &State, now: Instant) -> Self {
        let waiters_by_reason = state
            .waiters
            .by_reason()
            .map(|(reason, waiters)| ReasonCount {
                reason: reason.to_string(),
                waiters,
            })
            .collect();

        let mut handles = Vec::new();
        for holders in state.entries.values() {
            let mut claims: Vec<_> = holders.values().collect();
            claims.sort_by_key(|c| (c.created, c.id));
            handles.extend(claims.into_iter().map(|c| HandleStatus {
                entry: c.entry.clone(),
                reason: c.reason.clone(),
                expires_in: c.expires.get().map(|at| match at {
                    Some(at) => at.saturating_duration_since(now),
                    None => Duration::MAX,
                }),
                age: now.saturating_duration_since(c.created),
            }));
        }

        Self {
            num_entries: state.entries.len(),
            num_waiters: state.waiters.len(),
            waiters_by_reason,
            handles,
        }
    }
}

#[derive(Tabled)]
struct ReasonRow {
    num: usize,
    reason: String,
}

#[derive(Tabled)]
struct HandleRow {
    protocol: String,
    local: String,
    remote: String,
    reason: String,
    expires: String,
    created: String,
}

impl From<&HandleStatus> for HandleRow {
    fn from(h: &HandleStatus) -> Self {
        Self {
            protocol: format!("{:?}", h.entry.protocol),
            local: format!("{:?}", h.entry.local_addr),
            remote: format!("{:?}", h.entry.remote_addr),
            reason: format!("{:?}", h.reason),
            expires: match h.expires_in {
                None => "not done".to_string(),
                Some(Duration::MAX) => "never".to_string(),
                Some(d) => format!("{d:?}"),
            },
            created: format!("{:?} ago", h.age),
        }
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "num entries: {}", self.num_entries)?;
        writeln!(f)?;

        writeln!(f, "{} waiters:", self.num_waiters)?;
        let reasons = self.waiters_by_reason.iter().map(|r| ReasonRow {
            num: r.waiters,
            reason: format!("{:?}", r.reason),
        });
        writeln!(f, "{}", Table::new(reasons).with(Style::blank()))?;
        writeln!(f)?;

        writeln!(f, "handles:")?;
        let handles = self.handles.iter().map(HandleRow::from);
        writeln!(f, "{}", Table::new(handles).with(Style::blank()))
    }
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    fn as_millis(d: &Duration) -> u64 {
        u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
    }

    pub(super) fn duration<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(as_millis(d))
    }

    pub(super) fn option<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&as_millis(d)),
            None => s.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Instance, Priority};
    use tokio_util::sync::CancellationToken;

    fn sample() -> StatusSnapshot {
        StatusSnapshot {
            num_entries: 2,
            num_waiters: 3,
            waiters_by_reason: vec![
                ReasonCount {
                    reason: String::new(),
                    waiters: 1,
                },
                ReasonCount {
                    reason: "dht".to_string(),
                    waiters: 2,
                },
            ],
            handles: vec![
                HandleStatus {
                    entry: Entry::new("udp", "10.0.0.1:6881", "1.2.3.4:6881"),
                    reason: "dht".to_string(),
                    expires_in: None,
                    age: Duration::from_millis(1500),
                },
                HandleStatus {
                    entry: Entry::new("tcp", "10.0.0.1:6881", "5.6.7.8:443"),
                    reason: String::new(),
                    expires_in: Some(Duration::from_millis(250)),
                    age: Duration::from_secs(30),
                },
            ],
        }
    }

    /// Byte offset of `cell` within the row that starts with `first`.
    fn column(text: &str, first: &str, cell: &str) -> usize {
        text.lines()
            .filter(|l| l.trim_start().starts_with(first))
            .find_map(|l| l.find(cell))
            .unwrap_or_else(|| panic!("no row {first:?} with {cell:?} in:\n{text}"))
    }

    #[test]
    fn text_dump_is_column_aligned() {
        let text = sample().to_string();
        assert!(text.starts_with("num entries: 2\n\n3 waiters:\n"));
        assert!(text.contains("\n\nhandles:\n"));

        assert_eq!(column(&text, "num", "reason"), column(&text, "2", "\"dht\""));
        assert_eq!(column(&text, "num", "reason"), column(&text, "1", "\"\""));

        for (header, udp, tcp) in [
            ("local", "\"10.0.0.1:6881\"", "\"10.0.0.1:6881\""),
            ("remote", "\"1.2.3.4:6881\"", "\"5.6.7.8:443\""),
            ("expires", "not done", "250ms"),
            ("created", "1.5s ago", "30s ago"),
        ] {
            let at = column(&text, "protocol", header);
            assert_eq!(column(&text, "\"udp\"", udp), at, "{header} column");
            assert_eq!(column(&text, "\"tcp\"", tcp), at, "{header} column");
        }
    }

    #[test]
    fn text_dump_marks_unbounded_linger() {
        let mut status = sample();
        status.handles[1].expires_in = Some(Duration::MAX);
        let text = status.to_string();
        assert!(text.contains("never"));
        assert!(!text.contains("18446744073709551615"));
    }

    #[test]
    fn snapshot_serializes_durations_as_millis() {
        insta::assert_json_snapshot!("status_sample", sample());
    }

    #[tokio::test]
    async fn capture_reports_live_state() {
        let instance = Instance::new();
        instance.set_max_entries(1);
        instance.set_timeout(|_| Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let held = instance
            .wait(&cancel, Entry::new("udp", "a", "b"), "held", Priority(0))
            .await
            .unwrap();
        let released = instance
            .wait(&cancel, Entry::new("udp", "a", "b"), "released", Priority(0))
            .await
            .unwrap();
        released.done();

        let pending = {
            let instance = instance.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                instance
                    .wait(&cancel, Entry::new("tcp", "a", "c"), "blocked", Priority(1))
                    .await
            })
        };
        tokio::time::timeout(
            Duration::from_secs(5),
            instance.wait_for_state(|s| s.waiters.len() == 1),
        )
        .await
        .unwrap();

        let status = instance.status();
        assert_eq!(status.num_entries, 1);
        assert_eq!(status.num_waiters, 1);
        assert_eq!(
            status.waiters_by_reason,
            vec![ReasonCount {
                reason: "blocked".to_string(),
                waiters: 1
            }]
        );
        assert_eq!(status.handles.len(), 2);
        assert_eq!(status.handles[0].reason, "held");
        assert!(status.handles[0].expires_in.is_none());
        assert_eq!(status.handles[1].reason, "released");
        assert!(status.handles[1].expires_in.unwrap() > Duration::from_secs(59));

        let mut dump = Vec::new();
        instance.write_status(&mut dump).unwrap();
        let dump = String::from_utf8(dump).unwrap();
        assert!(dump.starts_with("num entries: 1\n"));
        assert!(dump.contains("\"blocked\""));
        assert!(dump.contains("not done"));

        cancel.cancel();
        assert!(pending.await.unwrap().is_none());
        drop(held);
    }
}
