//! Proposer <-> acceptor TCP transport. The acceptor side serves framed
//! requests from any number of proposer connections; the proposer side is an
//! `AcceptorEndpoint` with one in-flight request per connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::consensus::{
    AcceptRequest, AcceptResponse, AcceptorEndpoint, AcceptorReply,
    AcceptorRequest, PrepareRequest, PrepareResponse,
};
use crate::server::AcceptorHandle;
use crate::utils::{
    tcp_bind_with_retry, tcp_connect_with_retry, tcp_recv_obj, tcp_send_obj,
    SynleaseError,
};

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Max number of idle connections kept per remote acceptor.
const MAX_IDLE_CONNS: usize = 8;

/// Request frame on the wire; `id` is echoed back in the reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RequestFrame {
    id: u64,
    req: AcceptorRequest,
}

/// Reply frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ReplyFrame {
    id: u64,
    reply: AcceptorReply,
}

/// Serves an acceptor node to remote proposers over TCP.
pub struct AcceptorListener {
    /// Address actually bound.
    local_addr: SocketAddr,

    /// Join handle of the connection listener thread.
    _listener_handle: JoinHandle<()>,
}

impl AcceptorListener {
    /// Binds the listening socket and spawns the listener thread.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
        acceptor: AcceptorHandle,
    ) -> Result<Self, SynleaseError> {
        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let local_addr = listener.local_addr()?;
        pf_info!("acceptor listening on {}", local_addr);

        let listener_handle =
            tokio::spawn(Self::listener_thread(listener, acceptor));
        Ok(AcceptorListener {
            local_addr,
            _listener_handle: listener_handle,
        })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connection listener thread function.
    async fn listener_thread(listener: TcpListener, acceptor: AcceptorHandle) {
        pf_debug!("acceptor listener thread spawned");

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        pf_warn!("error setting nodelay for {}: {}", addr, e);
                    }
                    pf_debug!("accepted proposer connection from {}", addr);
                    tokio::spawn(Self::servant_thread(
                        stream,
                        addr,
                        acceptor.clone(),
                    ));
                }
                Err(e) => {
                    pf_warn!("error accepting proposer connection: {}", e);
                }
            }
        }
    }

    /// Per-connection servant thread function.
    async fn servant_thread(
        stream: TcpStream,
        addr: SocketAddr,
        acceptor: AcceptorHandle,
    ) {
        let (mut conn_read, mut conn_write) = stream.into_split();

        loop {
            let frame: RequestFrame = match tcp_recv_obj(&mut conn_read).await
            {
                Ok(frame) => frame,
                Err(e) => {
                    pf_debug!("proposer {} disconnected: {}", addr, e);
                    break;
                }
            };

            let reply = match acceptor.call(frame.req).await {
                Ok(reply) => reply,
                Err(e) => AcceptorReply::Failed { msg: e.to_string() },
            };
            let frame = ReplyFrame {
                id: frame.id,
                reply,
            };
            if let Err(e) = tcp_send_obj(&mut conn_write, &frame).await {
                pf_debug!("error replying to proposer {}: {}", addr, e);
                break;
            }
        }
    }
}

/// An acceptor reached over TCP.
#[derive(Debug)]
pub struct RemoteAcceptor {
    /// Acceptor address.
    addr: SocketAddr,

    /// Deadline of a single request/reply exchange.
    call_timeout: Duration,

    /// Next request frame ID.
    next_id: AtomicU64,

    /// Connections with no request in flight.
    idle: Mutex<Vec<TcpStream>>,
}

impl RemoteAcceptor {
    /// Creates the endpoint; connections are opened lazily.
    pub fn new(addr: SocketAddr, call_timeout: Duration) -> Self {
        RemoteAcceptor {
            addr,
            call_timeout,
            next_id: AtomicU64::new(0),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Sends a request and waits for the matching reply. A connection is
    /// taken out of the idle pool for the duration of the exchange and only
    /// returned on success, so a cancelled or failed exchange never leaves
    /// a half-read stream behind.
    pub async fn call(
        &self,
        req: AcceptorRequest,
    ) -> Result<AcceptorReply, SynleaseError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pooled = self
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();

        let exchange = async {
            let mut stream = match pooled {
                Some(stream) => stream,
                None => tcp_connect_with_retry(self.addr, 0).await?,
            };
            tcp_send_obj(&mut stream, &RequestFrame { id, req }).await?;
            let frame: ReplyFrame = tcp_recv_obj(&mut stream).await?;
            if frame.id != id {
                return Err(SynleaseError::msg(format!(
                    "reply id mismatch: expect {} got {}",
                    id, frame.id
                )));
            }
            Ok::<_, SynleaseError>((stream, frame.reply))
        };

        let (stream, reply) = time::timeout(self.call_timeout, exchange)
            .await
            .map_err(|_| {
                SynleaseError::timeout(format!(
                    "acceptor {} timed out after {:?}",
                    self.addr, self.call_timeout
                ))
            })??;

        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < MAX_IDLE_CONNS {
            idle.push(stream);
        }
        Ok(reply)
    }
}

#[async_trait]
impl AcceptorEndpoint for RemoteAcceptor {
    fn name(&self) -> String {
        self.addr.to_string()
    }

    async fn promise(
        &self,
        req: PrepareRequest,
    ) -> Result<PrepareResponse, SynleaseError> {
        match self.call(AcceptorRequest::Prepare(req)).await? {
            AcceptorReply::Prepare(reply) => Ok(reply),
            AcceptorReply::Failed { msg } => Err(SynleaseError::msg(msg)),
            reply => Err(SynleaseError::msg(format!(
                "unexpected reply to prepare: {:?}",
                reply
            ))),
        }
    }

    async fn accept(
        &self,
        req: AcceptRequest,
    ) -> Result<AcceptResponse, SynleaseError> {
        match self.call(AcceptorRequest::Accept(req)).await? {
            AcceptorReply::Accept(reply) => Ok(reply),
            AcceptorReply::Failed { msg } => Err(SynleaseError::msg(msg)),
            reply => Err(SynleaseError::msg(format!(
                "unexpected reply to accept: {:?}",
                reply
            ))),
        }
    }
}
