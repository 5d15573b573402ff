//! Shared vocabulary of the meridian history service: identifiers, history
//! events, persisted task records, cluster metadata and the storage
//! contracts every backend must honor.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::str::FromStr;
use std::sync::Arc;

pub mod cluster;
pub mod events;
pub mod execution;
pub mod storage;
pub mod tasks;
pub mod time;

pub use prefixed_ulid::{DomainId, RequestId, RunId};

/// Event IDs are 1-based and dense within a run; `EMPTY` marks "no event".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl EventId {
    pub const EMPTY: EventId = EventId(0);
    pub const FIRST: EventId = EventId(1);

    #[must_use]
    pub fn next(self) -> EventId {
        EventId(self.0 + 1)
    }

    #[must_use]
    pub fn is_set(self) -> bool {
        self != Self::EMPTY
    }
}

/// Shard-scoped task identifier, allocated from the shard's range token so
/// that a new shard owner always allocates above every old owner.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct TaskId(pub i64);

/// Failover versions totally order active-cluster ownership of a domain.
/// The version modulo the cluster failover increment identifies the cluster
/// that wrote at that version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct FailoverVersion(pub i64);

/// Caller-supplied workflow identifier. At most one *current* run exists per
/// (domain, workflow id); historical runs share it with distinct run ids.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkflowId(Arc<str>);

impl WorkflowId {
    #[must_use]
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<&str> for WorkflowId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for WorkflowId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for WorkflowId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::new(s))
    }
}

/// A concrete workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[display("{workflow_id}/{run_id}")]
pub struct WorkflowExecution {
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
}

impl WorkflowExecution {
    #[must_use]
    pub fn new(workflow_id: WorkflowId, run_id: RunId) -> Self {
        Self { workflow_id, run_id }
    }
}

pub mod prefixed_ulid {
    //! Machine-generated identifiers rendered as `{prefix}_{ulid}`.

    use serde::{Deserialize, Serialize};
    use std::fmt::{Debug, Display};
    use std::hash::{Hash, Hasher};
    use std::marker::PhantomData;
    use std::str::FromStr;
    use ulid::Ulid;

    pub trait IdKind: 'static {
        const PREFIX: &'static str;
    }

    pub mod kind {
        use super::IdKind;

        pub struct Dom;
        impl IdKind for Dom {
            const PREFIX: &'static str = "dom";
        }

        pub struct Run;
        impl IdKind for Run {
            const PREFIX: &'static str = "run";
        }

        pub struct Req;
        impl IdKind for Req {
            const PREFIX: &'static str = "req";
        }
    }

    pub struct PrefixedUlid<K: IdKind> {
        ulid: Ulid,
        _kind: PhantomData<fn(K) -> K>,
    }

    pub type DomainId = PrefixedUlid<kind::Dom>;
    pub type RunId = PrefixedUlid<kind::Run>;
    pub type RequestId = PrefixedUlid<kind::Req>;

    impl<K: IdKind> PrefixedUlid<K> {
        const fn from_ulid(ulid: Ulid) -> Self {
            Self {
                ulid,
                _kind: PhantomData,
            }
        }

        #[must_use]
        pub fn generate() -> Self {
            Self::from_ulid(Ulid::new())
        }

        /// Deterministic construction, used by tests for stable fixtures.
        #[must_use]
        pub const fn from_parts(timestamp_ms: u64, random: u128) -> Self {
            Self::from_ulid(Ulid::from_parts(timestamp_ms, random))
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum IdParseError {
        #[error("wrong prefix in `{input}`, expected `{expected}_`")]
        WrongPrefix { input: String, expected: &'static str },
        #[error("cannot parse ULID suffix of `{input}`")]
        BadUlid { input: String },
    }

    impl<K: IdKind> FromStr for PrefixedUlid<K> {
        type Err = IdParseError;

        fn from_str(input: &str) -> Result<Self, Self::Err> {
            let suffix = input
                .strip_prefix(K::PREFIX)
                .and_then(|rest| rest.strip_prefix('_'))
                .ok_or_else(|| IdParseError::WrongPrefix {
                    input: input.to_string(),
                    expected: K::PREFIX,
                })?;
            let ulid = Ulid::from_string(suffix).map_err(|_| IdParseError::BadUlid {
                input: input.to_string(),
            })?;
            Ok(Self::from_ulid(ulid))
        }
    }

    impl<K: IdKind> Display for PrefixedUlid<K> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}_{}", K::PREFIX, self.ulid)
        }
    }

    impl<K: IdKind> Debug for PrefixedUlid<K> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            Display::fmt(self, f)
        }
    }

    impl<K: IdKind> Clone for PrefixedUlid<K> {
        fn clone(&self) -> Self {
            *self
        }
    }

    impl<K: IdKind> Copy for PrefixedUlid<K> {}

    impl<K: IdKind> PartialEq for PrefixedUlid<K> {
        fn eq(&self, other: &Self) -> bool {
            self.ulid == other.ulid
        }
    }

    impl<K: IdKind> Eq for PrefixedUlid<K> {}

    impl<K: IdKind> Hash for PrefixedUlid<K> {
        fn hash<H: Hasher>(&self, state: &mut H) {
            self.ulid.hash(state);
        }
    }

    impl<K: IdKind> PartialOrd for PrefixedUlid<K> {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    impl<K: IdKind> Ord for PrefixedUlid<K> {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            self.ulid.cmp(&other.ulid)
        }
    }

    impl<K: IdKind> Serialize for PrefixedUlid<K> {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_str(self)
        }
    }

    impl<'de, K: IdKind> Deserialize<'de> for PrefixedUlid<K> {
        fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        }
    }
}

impl FromStr for WorkflowId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_ulid_round_trips_through_display() {
        let run = RunId::generate();
        let parsed: RunId = run.to_string().parse().unwrap();
        assert_eq!(run, parsed);
    }

    #[test]
    fn prefixed_ulid_rejects_wrong_prefix() {
        let run = RunId::generate();
        let as_domain = run.to_string().parse::<DomainId>();
        assert!(as_domain.is_err());
    }

    #[test]
    fn event_id_ordering() {
        assert!(EventId::EMPTY < EventId::FIRST);
        assert_eq!(EventId::FIRST.next(), EventId(2));
        assert!(!EventId::EMPTY.is_set());
    }
}
