//! Client endpoint of the lease service.

use std::net::SocketAddr;

use crate::server::{
    ApiReply, ApiRequest, LeaseRequestMessage, LeaseResponseMessage, RequestId,
};
use crate::utils::{
    tcp_connect_with_retry, tcp_recv_obj, tcp_send_obj, SynleaseError,
};

use tokio::net::TcpStream;
use tokio::time::{self, Duration};

/// Connection to one lease service. One request is in flight at a time; a
/// request that fails or times out drops the connection, and the next one
/// reconnects.
pub struct LeaseClient {
    /// Address of the service.
    server: SocketAddr,

    /// Established connection, if any.
    conn: Option<TcpStream>,

    /// Next request ID.
    next_id: RequestId,
}

impl LeaseClient {
    /// Creates the client and connects to the service.
    pub async fn new_and_setup(
        server: SocketAddr,
    ) -> Result<Self, SynleaseError> {
        let conn = tcp_connect_with_retry(server, 10).await?;
        pf_debug!("connected to lease service {}", server);
        Ok(LeaseClient {
            server,
            conn: Some(conn),
            next_id: 0,
        })
    }

    /// Makes sure a provider exists for the instance and returns how long
    /// until it starts issuing leases.
    pub async fn create_instance(
        &mut self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Duration, SynleaseError> {
        let id = self.next_id();
        let req = ApiRequest::CreateInstance {
            id,
            instance: instance.into(),
        };
        match self.call(req, timeout).await? {
            ApiReply::InstanceCreated {
                activation_wait, ..
            } => Ok(activation_wait),
            ApiReply::Error { err, .. } => Err(err),
            reply => logged_err!("unexpected reply type: {:?}", reply),
        }
    }

    /// Asks for the lease of an instance.
    pub async fn request_lease(
        &mut self,
        req: LeaseRequestMessage,
        timeout: Duration,
    ) -> Result<LeaseResponseMessage, SynleaseError> {
        let id = self.next_id();
        match self.call(ApiRequest::Lease { id, req }, timeout).await? {
            ApiReply::Lease { resp, .. } => Ok(resp),
            ApiReply::Error { err, .. } => Err(err),
            reply => logged_err!("unexpected reply type: {:?}", reply),
        }
    }

    fn next_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Sends a request and waits at most `timeout` for its reply.
    async fn call(
        &mut self,
        req: ApiRequest,
        timeout: Duration,
    ) -> Result<ApiReply, SynleaseError> {
        let id = req.id();
        let conn = self.conn.take();
        let server = self.server;

        let exchange = async {
            let mut conn = match conn {
                Some(conn) => conn,
                None => tcp_connect_with_retry(server, 0).await?,
            };
            tcp_send_obj(&mut conn, &req).await?;
            let reply: ApiReply = tcp_recv_obj(&mut conn).await?;
            if reply.id() != id {
                return Err(SynleaseError::msg(format!(
                    "reply id mismatch: expect {} got {}",
                    id,
                    reply.id()
                )));
            }
            Ok::<_, SynleaseError>((conn, reply))
        };

        let (conn, reply) =
            time::timeout(timeout, exchange).await.map_err(|_| {
                SynleaseError::timeout(format!(
                    "request {} timed out after {:?}",
                    id, timeout
                ))
            })??;
        self.conn = Some(conn);
        Ok(reply)
    }
}
