//! Consensus core: ballots, the lease value, synod membership, the acceptor
//! state machine, and the round-based register built on top of them.

mod acceptor;
mod ballot;
mod lease;
mod messages;
mod register;
mod synod;

#[cfg(test)]
pub(crate) mod testing;

pub use acceptor::{Acceptor, AcceptorState, WalEntry};
pub use ballot::{Ballot, BallotGenerator};
pub use lease::{Lease, LeaseConfiguration, ProviderConfig};
pub use messages::{
    AcceptRequest, AcceptResponse, AcceptorReply, AcceptorRequest,
    PrepareRequest, PrepareResponse,
};
pub use register::{
    AcceptorEndpoint, ReadResult, RoundBasedRegister, TxOutcome, WriteResult,
};
pub use synod::{AcceptorId, Instance, LocalNode, Synod, SynodConfiguration};
