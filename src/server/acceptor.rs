//! Durable acceptor node: the acceptor state machine plus its write-ahead
//! log, driven by a single task that serializes all requests.

use std::path::Path;

use crate::consensus::{
    AcceptRequest, AcceptResponse, Acceptor, AcceptorEndpoint, AcceptorReply,
    AcceptorRequest, PrepareRequest, PrepareResponse, WalEntry,
};
use crate::server::{LogAction, LogResult, StorageHub};
use crate::utils::SynleaseError;

use async_trait::async_trait;

use serde::Deserialize;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Configuration parameters struct of an acceptor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AcceptorConfig {
    /// Path to backing log file.
    pub backer_path: String,

    /// Whether to call `fdatasync()` after every log append.
    pub logger_sync: bool,

    /// Capacity of the request channel.
    pub chan_req_cap: usize,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        AcceptorConfig {
            backer_path: "/tmp/synlease.acceptor.wal".into(),
            logger_sync: true,
            chan_req_cap: 1024,
        }
    }
}

impl AcceptorConfig {
    /// Parses from an optional TOML string, filling absent fields with
    /// defaults.
    pub fn from_toml(config_str: Option<&str>) -> Result<Self, SynleaseError> {
        let config = parsed_config!(config_str => AcceptorConfig;
                                    backer_path, logger_sync, chan_req_cap)?;
        if config.chan_req_cap == 0 {
            return Err(SynleaseError::config("chan_req_cap is zero"));
        }
        if config.backer_path.is_empty() {
            return Err(SynleaseError::config("backer_path is empty"));
        }
        Ok(config)
    }
}

/// A request plus the channel to answer it on.
type AcceptorCall = (AcceptorRequest, oneshot::Sender<AcceptorReply>);

/// In-process handle to a running acceptor node. Cheap to clone; also the
/// local `AcceptorEndpoint` of the node's own acceptor.
#[derive(Debug, Clone)]
pub struct AcceptorHandle {
    name: String,
    tx_req: mpsc::Sender<AcceptorCall>,
}

impl AcceptorHandle {
    /// Submits a request and waits for the acceptor's reply.
    pub async fn call(
        &self,
        req: AcceptorRequest,
    ) -> Result<AcceptorReply, SynleaseError> {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.tx_req.send((req, tx_reply)).await?;
        Ok(rx_reply.await?)
    }
}

#[async_trait]
impl AcceptorEndpoint for AcceptorHandle {
    fn name(&self) -> String {
        self.name.clone()
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

/// Durable acceptor node.
pub struct AcceptorNode {
    /// Handle for submitting requests.
    handle: AcceptorHandle,

    /// Join handle of the acceptor thread.
    _acceptor_handle: JoinHandle<()>,
}

impl AcceptorNode {
    /// Opens the write-ahead log, replays it to rebuild state, then spawns
    /// the acceptor thread.
    pub async fn new_and_setup(
        name: impl Into<String>,
        config: AcceptorConfig,
    ) -> Result<Self, SynleaseError> {
        let mut storage_hub =
            StorageHub::new_and_setup(Path::new(&config.backer_path)).await?;
        let acceptor = Self::recover_from_wal(&mut storage_hub).await?;

        let (tx_req, rx_req) = mpsc::channel(config.chan_req_cap);
        let acceptor_handle = tokio::spawn(Self::acceptor_thread(
            acceptor,
            storage_hub,
            config.logger_sync,
            rx_req,
        ));

        Ok(AcceptorNode {
            handle: AcceptorHandle {
                name: name.into(),
                tx_req,
            },
            _acceptor_handle: acceptor_handle,
        })
    }

    pub fn handle(&self) -> AcceptorHandle {
        self.handle.clone()
    }

    /// Replays all durable log entries in order. A torn tail left by a crash
    /// mid-append is cut off so new entries start at a clean offset.
    async fn recover_from_wal(
        storage_hub: &mut StorageHub<WalEntry>,
    ) -> Result<Acceptor, SynleaseError> {
        let mut acceptor = Acceptor::new();
        let mut offset = 0;
        let mut num_entries = 0;

        loop {
            match storage_hub
                .do_sync_action(LogAction::Read { offset })
                .await?
            {
                LogResult::Read {
                    entry: Some(entry),
                    end_offset,
                } => {
                    acceptor.apply(entry);
                    offset = end_offset;
                    num_entries += 1;
                }
                LogResult::Read { entry: None, .. } => break,
                result => {
                    return logged_err!(
                        "unexpected log result type during recovery: {:?}",
                        result
                    );
                }
            }
        }

        if let LogResult::Truncate {
            offset_ok: true,
            now_size,
        } = storage_hub
            .do_sync_action(LogAction::Truncate { offset })
            .await?
        {
            pf_info!(
                "recovered {} wal entries over {} instances, log size {}",
                num_entries,
                acceptor.num_instances(),
                now_size
            );
            Ok(acceptor)
        } else {
            logged_err!("failed to truncate wal at offset {}", offset)
        }
    }

    /// Persists a log entry before the reply is released.
    async fn persist(
        storage_hub: &mut StorageHub<WalEntry>,
        entry: WalEntry,
        sync: bool,
    ) -> Result<(), SynleaseError> {
        match storage_hub
            .do_sync_action(LogAction::Append { entry, sync })
            .await?
        {
            LogResult::Append { .. } => Ok(()),
            result => logged_err!("unexpected log result type: {:?}", result),
        }
    }

    async fn handle_request(
        acceptor: &mut Acceptor,
        storage_hub: &mut StorageHub<WalEntry>,
        sync: bool,
        req: AcceptorRequest,
    ) -> AcceptorReply {
        let (reply, entry) = match req {
            AcceptorRequest::Prepare(req) => {
                pf_trace!("prepare {} bal {}", req.instance, req.ballot);
                let (reply, entry) = acceptor.handle_prepare(&req);
                (AcceptorReply::Prepare(reply), entry)
            }
            AcceptorRequest::Accept(req) => {
                pf_trace!("accept {} bal {}", req.instance, req.ballot);
                let (reply, entry) = acceptor.handle_accept(&req);
                (AcceptorReply::Accept(reply), entry)
            }
        };

        // state changes only once the entry is durable
        if let Some(entry) = entry {
            if let Err(e) =
                Self::persist(storage_hub, entry.clone(), sync).await
            {
                pf_error!("error persisting wal entry: {}", e);
                return AcceptorReply::Failed { msg: e.to_string() };
            }
            acceptor.apply(entry);
        }
        reply
    }

    /// Acceptor thread function.
    async fn acceptor_thread(
        mut acceptor: Acceptor,
        mut storage_hub: StorageHub<WalEntry>,
        sync: bool,
        mut rx_req: mpsc::Receiver<AcceptorCall>,
    ) {
        pf_debug!("acceptor thread spawned");

        while let Some((req, tx_reply)) = rx_req.recv().await {
            let reply = Self::handle_request(
                &mut acceptor,
                &mut storage_hub,
                sync,
                req,
            )
            .await;
            if tx_reply.send(reply).is_err() {
                // requester gave up waiting; the decision stays durable
                pf_trace!("requester dropped before reply");
            }
        }

        pf_debug!("acceptor thread exitted");
    }
}
