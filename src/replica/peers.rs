use crate::codec::AbiVersion;
use std::collections::HashMap;
use std::fmt;

/// Identity of a cluster member.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberId(String);

impl MemberId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        MemberId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity plus wire-format advertisement of a cluster member. The payload
/// version is checked on every message exchange so mixed-version clusters fail
/// loudly instead of misreading bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberInfo {
    pub id: MemberId,
    pub payload_version: AbiVersion,
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("member {0} appears more than once in the cluster config")]
    DuplicateMember(MemberId),
    #[error("local member id {0} is not in the cluster config")]
    MeNotInCluster(MemberId),
}

/// ClusterTracker is the static membership view of one replica: who is in the
/// cluster, which one is us, and what quorum means here.
#[derive(Debug)]
pub struct ClusterTracker {
    my_id: MemberId,
    members: HashMap<MemberId, MemberInfo>,
}

impl ClusterTracker {
    pub fn new(my_id: MemberId, members: Vec<MemberInfo>) -> Result<Self, ClusterError> {
        let mut by_id = HashMap::with_capacity(members.len());
        for member in members {
            let id = member.id.clone();
            if by_id.insert(id.clone(), member).is_some() {
                return Err(ClusterError::DuplicateMember(id));
            }
        }
        if !by_id.contains_key(&my_id) {
            return Err(ClusterError::MeNotInCluster(my_id));
        }

        Ok(ClusterTracker { my_id, members: by_id })
    }

    pub fn my_id(&self) -> &MemberId {
        &self.my_id
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.members.contains_key(id)
    }

    pub fn member(&self, id: &MemberId) -> Option<&MemberInfo> {
        self.members.get(id)
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.members.values().cloned().collect()
    }

    /// All members except us.
    pub fn peer_ids(&self) -> Vec<MemberId> {
        self.members.keys().filter(|id| **id != self.my_id).cloned().collect()
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    /// floor(N/2) + 1
    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str) -> MemberInfo {
        MemberInfo {
            id: MemberId::new(id),
            payload_version: AbiVersion::CURRENT,
        }
    }

    fn tracker(ids: &[&str]) -> ClusterTracker {
        ClusterTracker::new(MemberId::new(ids[0]), ids.iter().map(|id| member(id)).collect()).unwrap()
    }

    #[test]
    fn majority_counts() {
        assert_eq!(tracker(&["a"]).majority(), 1);
        assert_eq!(tracker(&["a", "b"]).majority(), 2);
        assert_eq!(tracker(&["a", "b", "c"]).majority(), 2);
        assert_eq!(tracker(&["a", "b", "c", "d"]).majority(), 3);
        assert_eq!(tracker(&["a", "b", "c", "d", "e"]).majority(), 3);
    }

    #[test]
    fn peers_exclude_self() {
        let t = tracker(&["a", "b", "c"]);
        let peers = t.peer_ids();
        assert_eq!(peers.len(), 2);
        assert!(!peers.contains(&MemberId::new("a")));
    }

    #[test]
    fn rejects_unknown_self() {
        let err = ClusterTracker::new(MemberId::new("z"), vec![member("a")]).unwrap_err();
        assert!(matches!(err, ClusterError::MeNotInCluster(_)));
    }

    #[test]
    fn rejects_duplicates() {
        let err = ClusterTracker::new(MemberId::new("a"), vec![member("a"), member("a")]).unwrap_err();
        assert!(matches!(err, ClusterError::DuplicateMember(_)));
    }
}
