//! Proposer <-> acceptor message payloads.

use crate::consensus::{Ballot, Instance, Lease};

use serde::{Deserialize, Serialize};

/// Phase-1 request: promise to ignore ballots lower than `ballot`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub instance: Instance,
    pub ballot: Ballot,
}

/// Phase-1 reply. On success carries the highest-ballotted value the
/// acceptor has accepted so far, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub promised: bool,
    pub highest_accepted_ballot: Option<Ballot>,
    pub accepted_lease: Option<Lease>,

    /// On rejection, the ballot that outranked the request.
    pub rejected_by: Option<Ballot>,
}

/// Phase-2 request: accept `lease` under `ballot`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptRequest {
    pub instance: Instance,
    pub ballot: Ballot,
    pub lease: Lease,
}

/// Phase-2 reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptResponse {
    pub accepted: bool,

    /// On rejection, the ballot that outranked the request.
    pub rejected_by: Option<Ballot>,
}

/// Request envelope sent to an acceptor over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceptorRequest {
    Prepare(PrepareRequest),
    Accept(AcceptRequest),
}

/// Reply envelope sent back by an acceptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceptorReply {
    Prepare(PrepareResponse),
    Accept(AcceptResponse),

    /// The acceptor failed to handle the request (e.g., storage failure).
    Failed { msg: String },
}
