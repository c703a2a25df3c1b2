//! Round-based register: a single-value replicated register driven by the
//! two-phase Synod protocol against a fixed set of acceptors.
//!
//! `read(b)` runs the prepare phase and returns the value carried by the
//! highest-ballotted promise among a quorum; `write(b, v)` runs the accept
//! phase. Either commits only if a quorum answers positively before the
//! round deadline. Individual acceptor failures count as non-responses and
//! never surface on their own.

use std::fmt;
use std::sync::Arc;

use crate::consensus::synod::majority;
use crate::consensus::{
    AcceptRequest, AcceptResponse, AcceptorId, Ballot, Instance, Lease,
    PrepareRequest, PrepareResponse,
};
use crate::utils::{Bitmap, SynleaseError};

use async_trait::async_trait;

use futures::stream::{FuturesUnordered, StreamExt};

use tokio::time::{self, Duration, Instant};

/// One acceptor as seen by a proposer. Implemented over TCP, over an
/// in-process channel, or by test fakes.
#[async_trait]
pub trait AcceptorEndpoint: Send + Sync {
    /// Human-readable address, for logging.
    fn name(&self) -> String;

    /// Phase 1: ask for a promise under the request ballot.
    async fn promise(
        &self,
        req: PrepareRequest,
    ) -> Result<PrepareResponse, SynleaseError>;

    /// Phase 2: ask to accept a value under the request ballot.
    async fn accept(
        &self,
        req: AcceptRequest,
    ) -> Result<AcceptResponse, SynleaseError>;
}

/// Aggregate outcome of a register round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Commit,
    Abort,
}

/// Result of `RoundBasedRegister::read()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub outcome: TxOutcome,

    /// Value currently stored; meaningful only on commit.
    pub lease: Option<Lease>,

    /// Ballot that preempted this round, if that is why it aborted.
    pub rejected_by: Option<Ballot>,
}

/// Result of `RoundBasedRegister::write()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub outcome: TxOutcome,

    /// Ballot that preempted this round, if that is why it aborted.
    pub rejected_by: Option<Ballot>,
}

/// Replicated single-value register of one instance.
pub struct RoundBasedRegister {
    /// Instance this register belongs to.
    instance: Instance,

    /// Synod members, indexed by acceptor ID.
    acceptors: Vec<Arc<dyn AcceptorEndpoint>>,

    /// Number of positive answers needed to commit.
    quorum: usize,

    /// Deadline of one phase.
    round_timeout: Duration,
}

impl fmt::Debug for RoundBasedRegister {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RoundBasedRegister")
            .field("instance", &self.instance)
            .field("population", &self.acceptors.len())
            .field("quorum", &self.quorum)
            .field("round_timeout", &self.round_timeout)
            .finish()
    }
}

/// Reply of one acceptor, tagged with its ID.
type Tagged<R> = (AcceptorId, Result<R, SynleaseError>);

impl RoundBasedRegister {
    /// Creates a register over the given acceptor endpoints, listed in synod
    /// member order. Quorum is a strict majority of them.
    pub fn new(
        instance: Instance,
        acceptors: Vec<Arc<dyn AcceptorEndpoint>>,
        round_timeout: Duration,
    ) -> Result<Self, SynleaseError> {
        if acceptors.is_empty() {
            return Err(SynleaseError::config("register has no acceptors"));
        }
        if acceptors.len() > AcceptorId::MAX as usize {
            return Err(SynleaseError::config(format!(
                "register has {} acceptors, too many",
                acceptors.len()
            )));
        }
        if round_timeout.is_zero() {
            return Err(SynleaseError::config("round timeout is zero"));
        }
        let quorum = majority(acceptors.len());
        Ok(RoundBasedRegister {
            instance,
            acceptors,
            quorum,
            round_timeout,
        })
    }

    #[inline]
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    #[inline]
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Runs the prepare phase under `ballot`.
    pub async fn read(
        &self,
        ballot: &Ballot,
    ) -> Result<ReadResult, SynleaseError> {
        let mut pending: FuturesUnordered<_> = self
            .acceptors
            .iter()
            .enumerate()
            .map(|(id, acceptor)| {
                let acceptor = acceptor.clone();
                let req = PrepareRequest {
                    instance: self.instance.clone(),
                    ballot: ballot.clone(),
                };
                async move { (id as AcceptorId, acceptor.promise(req).await) }
            })
            .collect();

        let deadline = Instant::now() + self.round_timeout;
        let mut acks = Bitmap::new(self.acceptors.len() as u8)?;
        let mut max_accepted: Option<(Ballot, Lease)> = None;

        loop {
            let next: Option<Tagged<PrepareResponse>> =
                match time::timeout_at(deadline, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        pf_debug!(
                            "read {} bal {} timed out with {} promises",
                            self.instance,
                            ballot,
                            acks.count()
                        );
                        return Ok(Self::read_aborted(None));
                    }
                };

            match next {
                None => {
                    pf_debug!(
                        "read {} bal {} got only {} promises",
                        self.instance,
                        ballot,
                        acks.count()
                    );
                    return Ok(Self::read_aborted(None));
                }

                Some((id, Err(e))) => {
                    pf_trace!(
                        "prepare to {} failed: {}",
                        self.acceptors[id as usize].name(),
                        e
                    );
                }

                Some((id, Ok(reply))) => {
                    if !reply.promised {
                        pf_debug!(
                            "read {} bal {} rejected by {} ({:?})",
                            self.instance,
                            ballot,
                            self.acceptors[id as usize].name(),
                            reply.rejected_by
                        );
                        return Ok(Self::read_aborted(reply.rejected_by));
                    }
                    if acks.set(id)? {
                        continue; // ignore duplicate answers
                    }

                    if let (Some(bal), Some(lease)) =
                        (reply.highest_accepted_ballot, reply.accepted_lease)
                    {
                        if max_accepted.as_ref().map_or(true, |(b, _)| *b < bal)
                        {
                            max_accepted = Some((bal, lease));
                        }
                    }

                    if acks.count() as usize >= self.quorum {
                        pf_trace!(
                            "read {} bal {} committed by {:?}",
                            self.instance,
                            ballot,
                            acks
                        );
                        return Ok(ReadResult {
                            outcome: TxOutcome::Commit,
                            lease: max_accepted.map(|(_, l)| l),
                            rejected_by: None,
                        });
                    }
                }
            }
        }
    }

    /// Runs the accept phase for `lease` under `ballot`.
    pub async fn write(
        &self,
        ballot: &Ballot,
        lease: &Lease,
    ) -> Result<WriteResult, SynleaseError> {
        let mut pending: FuturesUnordered<_> = self
            .acceptors
            .iter()
            .enumerate()
            .map(|(id, acceptor)| {
                let acceptor = acceptor.clone();
                let req = AcceptRequest {
                    instance: self.instance.clone(),
                    ballot: ballot.clone(),
                    lease: lease.clone(),
                };
                async move { (id as AcceptorId, acceptor.accept(req).await) }
            })
            .collect();

        let deadline = Instant::now() + self.round_timeout;
        let mut acks = Bitmap::new(self.acceptors.len() as u8)?;

        loop {
            let next: Option<Tagged<AcceptResponse>> =
                match time::timeout_at(deadline, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        pf_debug!(
                            "write {} bal {} timed out with {} accepts",
                            self.instance,
                            ballot,
                            acks.count()
                        );
                        return Ok(Self::write_aborted(None));
                    }
                };

            match next {
                None => {
                    pf_debug!(
                        "write {} bal {} got only {} accepts",
                        self.instance,
                        ballot,
                        acks.count()
                    );
                    return Ok(Self::write_aborted(None));
                }

                Some((id, Err(e))) => {
                    pf_trace!(
                        "accept to {} failed: {}",
                        self.acceptors[id as usize].name(),
                        e
                    );
                }

                Some((id, Ok(reply))) => {
                    if !reply.accepted {
                        pf_debug!(
                            "write {} bal {} rejected by {} ({:?})",
                            self.instance,
                            ballot,
                            self.acceptors[id as usize].name(),
                            reply.rejected_by
                        );
                        return Ok(Self::write_aborted(reply.rejected_by));
                    }
                    acks.set(id)?;

                    if acks.count() as usize >= self.quorum {
                        pf_trace!(
                            "write {} bal {} committed by {:?}",
                            self.instance,
                            ballot,
                            acks
                        );
                        return Ok(WriteResult {
                            outcome: TxOutcome::Commit,
                            rejected_by: None,
                        });
                    }
                }
            }
        }
    }

    fn read_aborted(rejected_by: Option<Ballot>) -> ReadResult {
        ReadResult {
            outcome: TxOutcome::Abort,
            lease: None,
            rejected_by,
        }
    }

    fn write_aborted(rejected_by: Option<Ballot>) -> WriteResult {
        WriteResult {
            outcome: TxOutcome::Abort,
            rejected_by,
        }
    }
}
