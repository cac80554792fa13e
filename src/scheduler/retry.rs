//! Failed offsets and what to do with them

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What the scheduler does with failed offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Record failures only
    #[default]
    Backlog,
    /// Re-dispatch failed offsets ahead of fresh ones until they have failed
    /// `max_attempts` times
    Redispatch { max_attempts: u32 },
}

/// One offset in the backlog
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedOffset {
    pub offset: u64,
    pub attempts: u32,
    pub last_error: String,
    pub cancelled: bool,
    /// Invalid arguments never succeed on retry
    pub retryable: bool,
    #[serde(skip)]
    in_flight: bool,
}

/// Offsets whose last attempt failed
#[derive(Debug, Default)]
pub struct RetryBacklog {
    entries: BTreeMap<u64, FailedOffset>,
}

impl RetryBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed attempt; returns the number of failures so far
    pub fn record(&mut self, offset: u64, error: &Error) -> u32 {
        let entry = self.entries.entry(offset).or_insert_with(|| FailedOffset {
            offset,
            attempts: 0,
            last_error: String::new(),
            cancelled: false,
            retryable: true,
            in_flight: false,
        });
        entry.attempts += 1;
        entry.last_error = error.to_string();
        entry.cancelled = error.is_cancelled();
        entry.retryable = !matches!(error, Error::InvalidArgument(_));
        entry.in_flight = false;
        entry.attempts
    }

    /// Drop an offset that has since succeeded
    pub fn resolve(&mut self, offset: u64) -> bool {
        self.entries.remove(&offset).is_some()
    }

    /// Lowest offset eligible for another attempt under `policy`, marked as
    /// in flight. Returns the offset and its attempt number.
    pub fn take_retry(&mut self, policy: RetryPolicy) -> Option<(u64, u32)> {
        let RetryPolicy::Redispatch { max_attempts } = policy else {
            return None;
        };

        let entry = self
            .entries
            .values_mut()
            .find(|e| !e.in_flight && e.retryable && e.attempts < max_attempts)?;
        entry.in_flight = true;
        Some((entry.offset, entry.attempts + 1))
    }

    /// Whether a failed offset is done for this run under `policy`.
    /// Cancelled offsets never are: they belong to the next run.
    pub fn is_settled(&self, offset: u64, policy: RetryPolicy) -> bool {
        let Some(entry) = self.entries.get(&offset) else {
            return false;
        };
        if entry.cancelled {
            return false;
        }
        match policy {
            RetryPolicy::Backlog => true,
            RetryPolicy::Redispatch { max_attempts } => {
                !entry.retryable || entry.attempts >= max_attempts
            }
        }
    }

    pub fn get(&self, offset: u64) -> Option<&FailedOffset> {
        self.entries.get(&offset)
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.entries.contains_key(&offset)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot in offset order
    pub fn entries(&self) -> Vec<FailedOffset> {
        self.entries.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(offset: u64) -> Error {
        Error::GenerationFailure {
            offset,
            reason: "boom".to_string(),
        }
    }

    #[test]
    fn test_backlog_policy_never_redispatches() {
        let mut backlog = RetryBacklog::new();
        backlog.record(40, &failure(40));
        assert_eq!(backlog.take_retry(RetryPolicy::Backlog), None);
        assert!(backlog.contains(40));
    }

    #[test]
    fn test_redispatch_until_max_attempts() {
        let policy = RetryPolicy::Redispatch { max_attempts: 2 };
        let mut backlog = RetryBacklog::new();

        assert_eq!(backlog.record(40, &failure(40)), 1);
        assert_eq!(backlog.take_retry(policy), Some((40, 2)));
        // In flight: not handed out twice
        assert_eq!(backlog.take_retry(policy), None);

        assert_eq!(backlog.record(40, &failure(40)), 2);
        assert_eq!(backlog.take_retry(policy), None);
        assert_eq!(backlog.len(), 1);
    }

    #[test]
    fn test_lowest_offset_first_and_resolve() {
        let policy = RetryPolicy::Redispatch { max_attempts: 5 };
        let mut backlog = RetryBacklog::new();
        backlog.record(90, &failure(90));
        backlog.record(30, &failure(30));

        assert_eq!(backlog.take_retry(policy), Some((30, 2)));
        assert!(backlog.resolve(30));
        assert_eq!(backlog.take_retry(policy), Some((90, 2)));
        assert!(!backlog.resolve(30));
    }

    #[test]
    fn test_invalid_argument_is_not_retryable() {
        let policy = RetryPolicy::Redispatch { max_attempts: 5 };
        let mut backlog = RetryBacklog::new();
        backlog.record(10, &Error::InvalidArgument("offset too large".to_string()));
        assert_eq!(backlog.take_retry(policy), None);
        assert!(!backlog.entries()[0].retryable);
    }

    #[test]
    fn test_settled_offsets() {
        let redispatch = RetryPolicy::Redispatch { max_attempts: 2 };
        let mut backlog = RetryBacklog::new();
        assert!(!backlog.is_settled(40, RetryPolicy::Backlog));

        backlog.record(40, &failure(40));
        assert!(backlog.is_settled(40, RetryPolicy::Backlog));
        assert!(!backlog.is_settled(40, redispatch));

        backlog.record(40, &failure(40));
        assert!(backlog.is_settled(40, redispatch));

        backlog.record(50, &Error::InvalidArgument("too far".to_string()));
        assert!(backlog.is_settled(50, redispatch));

        backlog.record(60, &Error::Cancelled);
        assert!(!backlog.is_settled(60, RetryPolicy::Backlog));
    }

    #[test]
    fn test_cancellation_is_flagged() {
        let mut backlog = RetryBacklog::new();
        backlog.record(10, &Error::Cancelled);
        let entry = backlog.get(10).expect("entry");
        assert!(entry.cancelled);
        assert_eq!(entry.attempts, 1);
    }
}
