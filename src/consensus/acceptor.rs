//! Acceptor-side state machine of the round-based register.
//!
//! Per instance an acceptor keeps the highest ballot it promised and the
//! highest (ballot, lease) pair it accepted. Requests are judged purely by
//! ballot ordering:
//!   - Prepare(b) is granted iff b is higher than both the promised ballot
//!     and the accepted ballot
//!   - Accept(b, v) is granted iff neither of them is higher than b
//!
//! Judging never touches the state. Every granted request yields a
//! `WalEntry`; the caller makes it durable and only then folds it in with
//! `apply()`, so a failed write leaves memory as it was.

use std::collections::HashMap;

use crate::consensus::{
    AcceptRequest, AcceptResponse, Ballot, Instance, Lease, PrepareRequest,
    PrepareResponse,
};

use serde::{Deserialize, Serialize};

/// Write-ahead log entry type of an acceptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEntry {
    /// Raised the promised ballot of an instance.
    Promise { instance: Instance, ballot: Ballot },

    /// Accepted a lease under a ballot.
    Accept {
        instance: Instance,
        ballot: Ballot,
        lease: Lease,
    },
}

/// Persistent per-instance acceptor state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptorState {
    pub promised: Option<Ballot>,
    pub accepted: Option<(Ballot, Lease)>,
}

impl AcceptorState {
    /// Highest ballot this state has been touched by.
    fn highest_seen(&self) -> Option<&Ballot> {
        let accepted = self.accepted.as_ref().map(|(b, _)| b);
        match (self.promised.as_ref(), accepted) {
            (Some(p), Some(a)) => Some(p.max(a)),
            (p, a) => p.or(a),
        }
    }
}

/// Acceptor state machine over all instances.
#[derive(Debug, Default)]
pub struct Acceptor {
    states: HashMap<Instance, AcceptorState>,
}

impl Acceptor {
    pub fn new() -> Self {
        Acceptor {
            states: HashMap::new(),
        }
    }

    /// Current state of an instance, if it has ever been touched.
    pub fn state(&self, instance: &Instance) -> Option<&AcceptorState> {
        self.states.get(instance)
    }

    /// Number of instances with state.
    pub fn num_instances(&self) -> usize {
        self.states.len()
    }

    /// Judges a Prepare request. Returns the reply and, if granted, the log
    /// entry to persist and then `apply()` before replying.
    pub fn handle_prepare(
        &self,
        req: &PrepareRequest,
    ) -> (PrepareResponse, Option<WalEntry>) {
        let fresh = AcceptorState::default();
        let state = self.states.get(&req.instance).unwrap_or(&fresh);

        if let Some(seen) = state.highest_seen() {
            if *seen >= req.ballot {
                return (
                    PrepareResponse {
                        promised: false,
                        highest_accepted_ballot: None,
                        accepted_lease: None,
                        rejected_by: Some(seen.clone()),
                    },
                    None,
                );
            }
        }

        let (highest_accepted_ballot, accepted_lease) = match &state.accepted {
            Some((b, l)) => (Some(b.clone()), Some(l.clone())),
            None => (None, None),
        };
        (
            PrepareResponse {
                promised: true,
                highest_accepted_ballot,
                accepted_lease,
                rejected_by: None,
            },
            Some(WalEntry::Promise {
                instance: req.instance.clone(),
                ballot: req.ballot.clone(),
            }),
        )
    }

    /// Judges an Accept request. Returns the reply and, if granted, the log
    /// entry to persist and then `apply()` before replying.
    pub fn handle_accept(
        &self,
        req: &AcceptRequest,
    ) -> (AcceptResponse, Option<WalEntry>) {
        let fresh = AcceptorState::default();
        let state = self.states.get(&req.instance).unwrap_or(&fresh);

        if let Some(seen) = state.highest_seen() {
            if *seen > req.ballot {
                return (
                    AcceptResponse {
                        accepted: false,
                        rejected_by: Some(seen.clone()),
                    },
                    None,
                );
            }
        }

        (
            AcceptResponse {
                accepted: true,
                rejected_by: None,
            },
            Some(WalEntry::Accept {
                instance: req.instance.clone(),
                ballot: req.ballot.clone(),
                lease: req.lease.clone(),
            }),
        )
    }

    /// Folds a granted (and persisted) entry into the state; also replays
    /// the log on recovery. An entry never lowers what is already there.
    pub fn apply(&mut self, entry: WalEntry) {
        match entry {
            WalEntry::Promise { instance, ballot } => {
                let state = self.states.entry(instance).or_default();
                if state.promised.as_ref().map_or(true, |p| *p < ballot) {
                    state.promised = Some(ballot);
                }
            }
            WalEntry::Accept {
                instance,
                ballot,
                lease,
            } => {
                let state = self.states.entry(instance).or_default();
                if state.promised.as_ref().map_or(true, |p| *p < ballot) {
                    state.promised = Some(ballot.clone());
                }
                if state.accepted.as_ref().map_or(true, |(a, _)| *a <= ballot)
                {
                    state.accepted = Some((ballot, lease));
                }
            }
        }
    }
}

#[cfg(test)]
mod acceptor_tests {
    use super::*;
    use bytes::Bytes;
    use std::time::{Duration, UNIX_EPOCH};

    fn ballot(n: u64, who: &'static [u8]) -> Ballot {
        Ballot::new(n, Bytes::from_static(who))
    }

    fn lease(owner: &'static [u8]) -> Lease {
        Lease::new(
            Bytes::from_static(owner),
            UNIX_EPOCH + Duration::from_secs(5),
            Bytes::from_static(b"payload"),
        )
    }

    fn prepare(n: u64) -> PrepareRequest {
        PrepareRequest {
            instance: Instance::new("i0"),
            ballot: ballot(n, b"x"),
        }
    }

    fn accept(n: u64, owner: &'static [u8]) -> AcceptRequest {
        AcceptRequest {
            instance: Instance::new("i0"),
            ballot: ballot(n, b"x"),
            lease: lease(owner),
        }
    }

    /// Judges and, if granted, commits right away like a node whose log
    /// write always succeeds.
    fn do_prepare(
        acc: &mut Acceptor,
        req: &PrepareRequest,
    ) -> (PrepareResponse, Option<WalEntry>) {
        let (reply, entry) = acc.handle_prepare(req);
        if let Some(e) = entry.clone() {
            acc.apply(e);
        }
        (reply, entry)
    }

    fn do_accept(
        acc: &mut Acceptor,
        req: &AcceptRequest,
    ) -> (AcceptResponse, Option<WalEntry>) {
        let (reply, entry) = acc.handle_accept(req);
        if let Some(e) = entry.clone() {
            acc.apply(e);
        }
        (reply, entry)
    }

    #[test]
    fn prepare_fresh_then_lower() {
        let mut acc = Acceptor::new();
        let (reply, entry) = do_prepare(&mut acc, &prepare(5));
        assert!(reply.promised);
        assert!(reply.accepted_lease.is_none());
        assert!(matches!(entry, Some(WalEntry::Promise { .. })));

        let (reply, entry) = do_prepare(&mut acc, &prepare(3));
        assert!(!reply.promised);
        assert_eq!(reply.rejected_by, Some(ballot(5, b"x")));
        assert!(entry.is_none());

        // equal ballot is not higher, hence rejected
        let (reply, _) = do_prepare(&mut acc, &prepare(5));
        assert!(!reply.promised);
    }

    #[test]
    fn accept_then_prepare_returns_value() {
        let mut acc = Acceptor::new();
        do_prepare(&mut acc, &prepare(1));
        let (reply, entry) = do_accept(&mut acc, &accept(1, b"a"));
        assert!(reply.accepted);
        assert!(matches!(entry, Some(WalEntry::Accept { .. })));

        let (reply, _) = do_prepare(&mut acc, &prepare(2));
        assert!(reply.promised);
        assert_eq!(reply.highest_accepted_ballot, Some(ballot(1, b"x")));
        assert_eq!(reply.accepted_lease, Some(lease(b"a")));
    }

    #[test]
    fn accept_rejected_after_higher_promise() {
        let mut acc = Acceptor::new();
        do_prepare(&mut acc, &prepare(1));
        do_prepare(&mut acc, &prepare(7));
        let (reply, entry) = do_accept(&mut acc, &accept(1, b"a"));
        assert!(!reply.accepted);
        assert_eq!(reply.rejected_by, Some(ballot(7, b"x")));
        assert!(entry.is_none());
        assert!(acc.state(&Instance::new("i0")).unwrap().accepted.is_none());
    }

    #[test]
    fn instances_are_independent() {
        let mut acc = Acceptor::new();
        do_prepare(&mut acc, &prepare(9));
        let other = PrepareRequest {
            instance: Instance::new("i1"),
            ballot: ballot(1, b"x"),
        };
        assert!(do_prepare(&mut acc, &other).0.promised);
        assert_eq!(acc.num_instances(), 2);
    }

    #[test]
    fn replay_rebuilds_state() {
        let mut acc = Acceptor::new();
        let mut log = vec![];
        log.extend(do_prepare(&mut acc, &prepare(1)).1);
        log.extend(do_accept(&mut acc, &accept(1, b"a")).1);
        log.extend(do_prepare(&mut acc, &prepare(4)).1);
        log.extend(do_prepare(&mut acc, &prepare(2)).1); // rejected, no entry
        assert_eq!(log.len(), 3);

        let mut recovered = Acceptor::new();
        for entry in log {
            recovered.apply(entry);
        }
        let inst = Instance::new("i0");
        assert_eq!(recovered.state(&inst), acc.state(&inst));
        assert!(!recovered.handle_prepare(&prepare(3)).0.promised);
    }

    #[test]
    fn judging_leaves_state_untouched() {
        let mut acc = Acceptor::new();
        do_prepare(&mut acc, &prepare(1));
        let before = acc.state(&Instance::new("i0")).cloned();

        // granted but never committed, as when the log write fails
        let (reply, entry) = acc.handle_accept(&accept(1, b"a"));
        assert!(reply.accepted);
        assert!(entry.is_some());
        let (reply, entry) = acc.handle_prepare(&prepare(6));
        assert!(reply.promised);
        assert!(entry.is_some());
        assert_eq!(acc.state(&Instance::new("i0")).cloned(), before);

        // a lower ballot is still welcome, nothing was raised
        let (reply, _) = do_prepare(&mut acc, &prepare(2));
        assert!(reply.promised);
        assert!(reply.accepted_lease.is_none());

        // untouched instances stay absent
        let other = PrepareRequest {
            instance: Instance::new("i9"),
            ballot: ballot(1, b"x"),
        };
        acc.handle_prepare(&other);
        assert!(acc.state(&Instance::new("i9")).is_none());
    }
}
