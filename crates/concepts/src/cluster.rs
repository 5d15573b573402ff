//! Cluster topology and failover-version arithmetic.
//!
//! Every cluster owns a congruence class of failover versions: cluster `c`
//! with initial version `i` writes at versions `i`, `i + increment`,
//! `i + 2 * increment`, ... . Comparing versions therefore orders active
//! ownership across failovers, and `version mod increment` recovers the
//! writing cluster.

use crate::{DomainId, FailoverVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::sync::Arc;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterName(Arc<str>);

impl ClusterName {
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ClusterName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for ClusterName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<&str> for ClusterName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Static description of the cluster topology this process is part of.
#[derive(Debug, Clone)]
pub struct ClusterMetadata {
    current_cluster: ClusterName,
    failover_version_increment: i64,
    // initial failover version -> cluster owning that congruence class
    initial_versions: BTreeMap<i64, ClusterName>,
}

impl ClusterMetadata {
    /// `members` maps each cluster to its initial failover version; all
    /// initial versions must be distinct and below the increment.
    #[must_use]
    pub fn new(
        current_cluster: ClusterName,
        failover_version_increment: i64,
        members: impl IntoIterator<Item = (ClusterName, i64)>,
    ) -> Self {
        let initial_versions: BTreeMap<i64, ClusterName> = members
            .into_iter()
            .map(|(cluster, initial)| (initial, cluster))
            .collect();
        assert!(failover_version_increment > 0);
        assert!(
            initial_versions
                .keys()
                .all(|initial| (0..failover_version_increment).contains(initial)),
            "initial versions must be distinct and below the failover increment"
        );
        assert!(
            initial_versions.values().any(|c| *c == current_cluster),
            "current cluster must be a topology member"
        );
        Self {
            current_cluster,
            failover_version_increment,
            initial_versions,
        }
    }

    #[must_use]
    pub fn current_cluster(&self) -> &ClusterName {
        &self.current_cluster
    }

    #[must_use]
    pub fn failover_version_increment(&self) -> i64 {
        self.failover_version_increment
    }

    /// The cluster that wrote at `version`.
    #[must_use]
    pub fn cluster_for_version(&self, version: FailoverVersion) -> Option<&ClusterName> {
        self.initial_versions
            .get(&version.0.rem_euclid(self.failover_version_increment))
    }

    /// Whether two versions belong to the same cluster's congruence class.
    /// A domain can fail away and back without generating events, leaving
    /// version gaps that are whole multiples of the increment.
    #[must_use]
    pub fn is_version_from_same_cluster(&self, a: FailoverVersion, b: FailoverVersion) -> bool {
        (a.0 - b.0).rem_euclid(self.failover_version_increment) == 0
    }

    /// Smallest version owned by `cluster` that is strictly greater than
    /// `current`.
    #[must_use]
    pub fn next_failover_version(
        &self,
        cluster: &ClusterName,
        current: FailoverVersion,
    ) -> Option<FailoverVersion> {
        let initial = self
            .initial_versions
            .iter()
            .find(|(_, c)| *c == cluster)
            .map(|(initial, _)| *initial)?;
        let mut candidate = initial
            + (current.0 - initial).div_euclid(self.failover_version_increment)
                * self.failover_version_increment;
        while candidate <= current.0 {
            candidate += self.failover_version_increment;
        }
        Some(FailoverVersion(candidate))
    }
}

/// Domain metadata as served by the (external) domain cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEntry {
    pub id: DomainId,
    pub name: String,
    pub is_global: bool,
    pub active_cluster: ClusterName,
    pub clusters: Vec<ClusterName>,
    pub failover_version: FailoverVersion,
}

impl DomainEntry {
    /// Local domains are active everywhere; global domains only in their
    /// active cluster.
    #[must_use]
    pub fn is_active_in(&self, cluster: &ClusterName) -> bool {
        !self.is_global || self.active_cluster == *cluster
    }
}

/// Read side of the domain metadata cache.
pub trait DomainRegistry: Send + Sync {
    fn entry_by_id(&self, id: &DomainId) -> Option<DomainEntry>;
    fn entry_by_name(&self, name: &str) -> Option<DomainEntry>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> ClusterMetadata {
        ClusterMetadata::new(
            ClusterName::from("alpha"),
            10,
            [(ClusterName::from("alpha"), 1), (ClusterName::from("beta"), 2)],
        )
    }

    #[test]
    fn cluster_for_version_uses_congruence_class() {
        let meta = metadata();
        assert_eq!(
            meta.cluster_for_version(FailoverVersion(11)).unwrap().as_str(),
            "alpha"
        );
        assert_eq!(
            meta.cluster_for_version(FailoverVersion(22)).unwrap().as_str(),
            "beta"
        );
        assert!(meta.cluster_for_version(FailoverVersion(3)).is_none());
    }

    #[test]
    fn same_cluster_versions_differ_by_whole_increments() {
        let meta = metadata();
        assert!(meta.is_version_from_same_cluster(FailoverVersion(1), FailoverVersion(31)));
        assert!(!meta.is_version_from_same_cluster(FailoverVersion(1), FailoverVersion(32)));
    }

    #[test]
    fn next_failover_version_is_strictly_greater() {
        let meta = metadata();
        let next = meta
            .next_failover_version(&ClusterName::from("beta"), FailoverVersion(11))
            .unwrap();
        assert_eq!(next, FailoverVersion(12));
        let next = meta
            .next_failover_version(&ClusterName::from("alpha"), FailoverVersion(11))
            .unwrap();
        assert_eq!(next, FailoverVersion(21));
    }
}
