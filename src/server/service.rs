//! Client-facing lease service: hosts one lease provider per instance and
//! answers lease requests over TCP.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use crate::consensus::{
    AcceptorEndpoint, BallotGenerator, Instance, LocalNode, ProviderConfig,
    RoundBasedRegister,
};
use crate::server::InstanceLeaseProvider;
use crate::utils::{
    tcp_bind_with_retry, tcp_recv_obj, tcp_send_obj, Clock, SynleaseError,
};

use bytes::Bytes;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::{Deserialize, Serialize};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// External API request ID type.
pub type RequestId = u64;

/// A requesting party, as named in lease requests and responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub identity: Bytes,
    pub uri: String,
}

/// Ask for the lease of an instance on behalf of `requestor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRequestMessage {
    pub instance: String,
    pub lease_time_span: Duration,
    pub requestor: Node,
}

/// Current lease of an instance as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub instance: String,
    pub owner: Node,
    pub expires_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseResponseMessage {
    /// Whether the requestor is the owner of the returned lease.
    pub lease_acquired: bool,

    /// Current lease, if known.
    pub lease: Option<LeaseInfo>,
}

/// Request received from client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Make sure a provider exists for the instance.
    CreateInstance { id: RequestId, instance: String },

    /// Lease request.
    Lease {
        id: RequestId,
        req: LeaseRequestMessage,
    },
}

impl ApiRequest {
    pub fn id(&self) -> RequestId {
        match self {
            ApiRequest::CreateInstance { id, .. } => *id,
            ApiRequest::Lease { id, .. } => *id,
        }
    }
}

/// Reply back to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiReply {
    /// Reply to instance creation; leases are served after `activation_wait`.
    InstanceCreated {
        id: RequestId,
        activation_wait: Duration,
    },

    /// Reply to lease request.
    Lease {
        id: RequestId,
        resp: LeaseResponseMessage,
    },

    /// Request failed; carries the error as raised on the server.
    Error { id: RequestId, err: SynleaseError },
}

impl ApiReply {
    pub fn id(&self) -> RequestId {
        match self {
            ApiReply::InstanceCreated { id, .. } => *id,
            ApiReply::Lease { id, .. } => *id,
            ApiReply::Error { id, .. } => *id,
        }
    }
}

/// The lease service of one node. Providers are created on demand and
/// share the synod endpoints, local node identity, and clock.
pub struct LeaseService {
    /// Identity of this node.
    local_node: LocalNode,

    /// Endpoints of the synod members.
    acceptors: Vec<Arc<dyn AcceptorEndpoint>>,

    /// Provider configuration applied to every instance.
    config: ProviderConfig,

    /// Local wall clock.
    clock: Arc<dyn Clock>,

    /// Map from instance -> its provider.
    providers: RwLock<HashMap<Instance, Arc<InstanceLeaseProvider>>>,
}

impl LeaseService {
    pub fn new(
        local_node: LocalNode,
        acceptors: Vec<Arc<dyn AcceptorEndpoint>>,
        config: ProviderConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SynleaseError> {
        config.validate()?;
        if acceptors.is_empty() {
            return Err(SynleaseError::config("lease service has no acceptors"));
        }
        Ok(LeaseService {
            local_node,
            acceptors,
            config,
            clock,
            providers: RwLock::new(HashMap::new()),
        })
    }

    #[inline]
    pub fn local_node(&self) -> &LocalNode {
        &self.local_node
    }

    /// Number of instances with a provider.
    pub fn num_instances(&self) -> usize {
        self.providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Returns the provider of the instance, creating it if absent.
    pub fn create_instance(
        &self,
        instance: Instance,
    ) -> Result<Arc<InstanceLeaseProvider>, SynleaseError> {
        if let Some(provider) = self
            .providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&instance)
        {
            return Ok(provider.clone());
        }

        let mut providers =
            self.providers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(provider) = providers.get(&instance) {
            return Ok(provider.clone());
        }
        let register = RoundBasedRegister::new(
            instance.clone(),
            self.acceptors.clone(),
            self.config.round_timeout(),
        )?;
        let provider = Arc::new(InstanceLeaseProvider::new(
            instance.clone(),
            register,
            BallotGenerator::new(),
            self.local_node.clone(),
            &self.config,
            self.clock.clone(),
        )?);
        pf_debug!("created provider for {}", instance);
        providers.insert(instance, provider.clone());
        Ok(provider)
    }

    /// Serves one lease request. The requestor is encoded as the owner
    /// payload; it is reported as acquiring the lease only if this node owns
    /// the lease and the lease carries that requestor.
    pub async fn handle_lease(
        &self,
        req: LeaseRequestMessage,
    ) -> Result<LeaseResponseMessage, SynleaseError> {
        let max_span = Duration::from_millis(self.config.max_lease_ms);
        if req.lease_time_span.is_zero() || req.lease_time_span > max_span {
            return Err(SynleaseError::invalid(format!(
                "lease time span {:?} not within (0, {:?}]",
                req.lease_time_span, max_span
            )));
        }
        if req.requestor.identity.is_empty() {
            return Err(SynleaseError::invalid("requestor identity is empty"));
        }

        let provider = self.create_instance(Instance::new(&req.instance))?;
        let payload = Bytes::from(encode_to_vec(&req.requestor)?);
        let outcome = provider.get_lease(payload.clone()).await?;

        let lease = outcome.lease();
        let owner: Node = decode_from_slice(&lease.owner_payload)?;
        Ok(LeaseResponseMessage {
            lease_acquired: outcome.is_acquired()
                && lease.owner_payload == payload,
            lease: Some(LeaseInfo {
                instance: req.instance,
                owner,
                expires_at: lease.expires_at,
            }),
        })
    }

    /// Handles one API request; failures turn into `ApiReply::Error`.
    pub async fn handle(&self, req: ApiRequest) -> ApiReply {
        let id = req.id();
        let result = match req {
            ApiRequest::CreateInstance { instance, .. } => self
                .create_instance(Instance::new(instance))
                .map(|provider| ApiReply::InstanceCreated {
                    id,
                    activation_wait: provider.activation_wait(),
                }),
            ApiRequest::Lease { req, .. } => self
                .handle_lease(req)
                .await
                .map(|resp| ApiReply::Lease { id, resp }),
        };

        result.unwrap_or_else(|e| {
            pf_debug!("request {} failed: {}", id, e);
            ApiReply::Error { id, err: e }
        })
    }
}

/// Serves a lease service to clients over TCP.
pub struct ApiListener {
    /// Address actually bound.
    local_addr: SocketAddr,

    /// Join handle of the client listener thread.
    _listener_handle: JoinHandle<()>,
}

impl ApiListener {
    /// Binds the listening socket and spawns the client listener thread.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
        service: Arc<LeaseService>,
    ) -> Result<Self, SynleaseError> {
        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let local_addr = listener.local_addr()?;
        pf_info!("lease service listening on {}", local_addr);

        let listener_handle =
            tokio::spawn(Self::listener_thread(listener, service));
        Ok(ApiListener {
            local_addr,
            _listener_handle: listener_handle,
        })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Client listener thread function.
    async fn listener_thread(listener: TcpListener, service: Arc<LeaseService>) {
        pf_debug!("client listener thread spawned");

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    pf_debug!("accepted client connection from {}", addr);
                    tokio::spawn(Self::client_servant_thread(
                        stream,
                        addr,
                        service.clone(),
                    ));
                }
                Err(e) => {
                    pf_warn!("error accepting client connection: {}", e);
                }
            }
        }
    }

    /// Per-client servant thread function. Requests on one connection are
    /// answered in order.
    async fn client_servant_thread(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<LeaseService>,
    ) {
        let (mut conn_read, mut conn_write) = stream.into_split();

        loop {
            let req: ApiRequest = match tcp_recv_obj(&mut conn_read).await {
                Ok(req) => req,
                Err(e) => {
                    pf_debug!("client {} disconnected: {}", addr, e);
                    break;
                }
            };

            let reply = service.handle(req).await;
            if let Err(e) = tcp_send_obj(&mut conn_write, &reply).await {
                pf_debug!("error replying to client {}: {}", addr, e);
                break;
            }
        }
    }
}
