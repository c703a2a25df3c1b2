//! Synlease: time-bounded exclusive leases over named instances, agreed on by
//! a synod of acceptors through a Paxos round-based register.

#[macro_use]
mod utils;

mod client;
mod consensus;
mod server;

// Public interface exports:

pub use crate::utils::{
    logger_init, me_init, Bitmap, Clock, ManualClock, SkewedClock,
    SynleaseError, SystemClock, ME,
};

pub use crate::consensus::{
    AcceptRequest, AcceptResponse, Acceptor, AcceptorEndpoint, AcceptorId,
    AcceptorReply, AcceptorRequest, AcceptorState, Ballot, BallotGenerator,
    Instance, Lease, LeaseConfiguration, LocalNode, PrepareRequest,
    PrepareResponse, ProviderConfig, ReadResult, RoundBasedRegister, Synod,
    SynodConfiguration, TxOutcome, WalEntry, WriteResult,
};

pub use crate::server::{
    AcceptorConfig, AcceptorHandle, AcceptorListener, AcceptorNode,
    ApiListener, ApiReply, ApiRequest, InstanceLeaseProvider, LeaseInfo,
    LeaseOutcome, LeaseRequestMessage, LeaseResponseMessage, LeaseService,
    Node, RemoteAcceptor, RequestId,
};

pub use crate::client::LeaseClient;
