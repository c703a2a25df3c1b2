//! Server side: durable acceptor node, its TCP transport, per-instance lease
//! providers, and the client-facing lease service.

mod acceptor;
mod provider;
mod service;
mod storage;
mod transport;

pub use acceptor::{AcceptorConfig, AcceptorHandle, AcceptorNode};
pub use provider::{InstanceLeaseProvider, LeaseOutcome};
pub use service::{
    ApiListener, ApiReply, ApiRequest, LeaseInfo, LeaseRequestMessage,
    LeaseResponseMessage, LeaseService, Node, RequestId,
};
pub use transport::{AcceptorListener, RemoteAcceptor};

pub(crate) use storage::{LogAction, LogResult, StorageHub};
