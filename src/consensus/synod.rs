//! Fixed synod membership, local node identity, and instance naming.

use std::collections::HashSet;
use std::fmt;

use crate::utils::SynleaseError;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Index of an acceptor within its synod's member list.
pub type AcceptorId = u8;

/// Opaque named resource for which a distinct register exists.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Instance(pub String);

impl Instance {
    pub fn new(name: impl Into<String>) -> Self {
        Instance(name.into())
    }

    /// Stable identity bytes of the instance.
    pub fn identity(&self) -> Bytes {
        Bytes::copy_from_slice(self.0.as_bytes())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of this process: used as proposer identity in ballots and as
/// owner identity of the leases it issues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalNode {
    pub socket_identity: Bytes,
    pub uri: String,
}

impl LocalNode {
    pub fn new(socket_identity: impl Into<Bytes>, uri: impl Into<String>) -> Self {
        LocalNode {
            socket_identity: socket_identity.into(),
            uri: uri.into(),
        }
    }

    /// Creates a node with a random 16-byte identity.
    pub fn random(uri: impl Into<String>) -> Self {
        let identity: [u8; 16] = rand::random();
        Self::new(Bytes::copy_from_slice(&identity), uri)
    }
}

impl fmt::Display for LocalNode {
    /// `uri` plus the first identity bytes in hex, e.g. `tcp://h:1#9f3a01c2`.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#", self.uri)?;
        for b in self.socket_identity.iter().take(4) {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Majority of a population of acceptors, i.e. `ceil((N + 1) / 2)`. The
/// one quorum rule shared by `Synod` and `RoundBasedRegister`.
#[inline]
pub(crate) fn majority(population: usize) -> usize {
    population / 2 + 1
}

/// Fixed acceptor membership of a register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Synod {
    members: Vec<String>,
}

impl Synod {
    /// Validates membership: non-empty, no duplicates, at most 255 members.
    pub fn new(members: Vec<String>) -> Result<Self, SynleaseError> {
        if members.is_empty() {
            return Err(SynleaseError::config("synod membership is empty"));
        }
        if members.len() > AcceptorId::MAX as usize {
            return Err(SynleaseError::config(format!(
                "synod of {} members too large",
                members.len()
            )));
        }
        let mut seen = HashSet::new();
        for m in members.iter() {
            if !seen.insert(m) {
                return Err(SynleaseError::config(format!(
                    "duplicate synod member '{}'",
                    m
                )));
            }
        }
        Ok(Synod { members })
    }

    #[inline]
    pub fn members(&self) -> &[String] {
        &self.members
    }

    #[inline]
    pub fn population(&self) -> u8 {
        self.members.len() as u8
    }

    #[inline]
    pub fn quorum(&self) -> usize {
        majority(self.members.len())
    }
}

/// Synod membership as seen from one node.
#[derive(Debug, Clone)]
pub struct SynodConfiguration {
    pub local_node: LocalNode,
    pub synod: Synod,
}

impl SynodConfiguration {
    pub fn new(
        local_node: LocalNode,
        members: Vec<String>,
    ) -> Result<Self, SynleaseError> {
        if local_node.socket_identity.is_empty() {
            return Err(SynleaseError::config("local node identity is empty"));
        }
        Ok(SynodConfiguration {
            local_node,
            synod: Synod::new(members)?,
        })
    }
}

#[cfg(test)]
mod synod_tests {
    use super::*;

    fn members(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("127.0.0.1:{}", 53700 + i)).collect()
    }

    #[test]
    fn quorum_sizes() -> Result<(), SynleaseError> {
        assert_eq!(Synod::new(members(1))?.quorum(), 1);
        assert_eq!(Synod::new(members(2))?.quorum(), 2);
        assert_eq!(Synod::new(members(3))?.quorum(), 2);
        assert_eq!(Synod::new(members(4))?.quorum(), 3);
        assert_eq!(Synod::new(members(5))?.quorum(), 3);
        Ok(())
    }

    #[test]
    fn local_node_display() {
        let node = LocalNode::new(
            Bytes::from_static(&[0x9f, 0x3a, 0x01, 0xc2, 0xff]),
            "tcp://10.0.0.1:53800",
        );
        assert_eq!(node.to_string(), "tcp://10.0.0.1:53800#9f3a01c2");
        let short = LocalNode::new(Bytes::from_static(b"x"), "tcp://h");
        assert_eq!(short.to_string(), "tcp://h#78");
    }

    #[test]
    fn invalid_membership() {
        assert!(matches!(Synod::new(vec![]), Err(SynleaseError::Config(_))));
        assert!(Synod::new(vec!["a:1".into(), "a:1".into()]).is_err());
        assert!(Synod::new(members(256)).is_err());
        assert!(SynodConfiguration::new(
            LocalNode::new(Bytes::new(), "tcp://localhost"),
            members(3)
        )
        .is_err());
    }

    #[test]
    fn random_identities_differ() {
        let a = LocalNode::random("tcp://a");
        let b = LocalNode::random("tcp://b");
        assert_eq!(a.socket_identity.len(), 16);
        assert_ne!(a.socket_identity, b.socket_identity);
        assert_eq!(Instance::new("17").identity(), Bytes::from_static(b"17"));
    }
}
