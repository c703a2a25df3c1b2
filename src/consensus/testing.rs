//! In-memory acceptor fakes shared by unit tests.

use std::sync::Mutex;
use std::time::{Duration, UNIX_EPOCH};

use crate::consensus::{
    AcceptRequest, AcceptResponse, Acceptor, AcceptorEndpoint, Lease,
    PrepareRequest, PrepareResponse,
};
use crate::utils::SynleaseError;

use async_trait::async_trait;

use bytes::Bytes;

/// How a fake acceptor reacts to requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultMode {
    /// Answers normally.
    Healthy,
    /// Fails every request immediately, like a refused connection.
    Unreachable,
    /// Never answers.
    Silent,
}

/// Acceptor state machine behind a mutex, with switchable faults.
#[derive(Debug)]
pub(crate) struct FakeAcceptor {
    id: usize,
    mode: Mutex<FaultMode>,
    acceptor: Mutex<Acceptor>,
    calls: Mutex<usize>,
}

impl FakeAcceptor {
    pub(crate) fn new(id: usize) -> Self {
        FakeAcceptor {
            id,
            mode: Mutex::new(FaultMode::Healthy),
            acceptor: Mutex::new(Acceptor::new()),
            calls: Mutex::new(0),
        }
    }

    pub(crate) fn set_mode(&self, mode: FaultMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Number of requests received so far, answered or not.
    pub(crate) fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    async fn gate(&self) -> Result<(), SynleaseError> {
        *self.calls.lock().unwrap() += 1;
        let mode = *self.mode.lock().unwrap();
        match mode {
            FaultMode::Healthy => Ok(()),
            FaultMode::Unreachable => Err(SynleaseError::msg(format!(
                "fake acceptor {} unreachable",
                self.id
            ))),
            FaultMode::Silent => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl AcceptorEndpoint for FakeAcceptor {
    fn name(&self) -> String {
        format!("fake-{}", self.id)
    }

    async fn promise(
        &self,
        req: PrepareRequest,
    ) -> Result<PrepareResponse, SynleaseError> {
        self.gate().await?;
        let mut acceptor = self.acceptor.lock().unwrap();
        let (reply, entry) = acceptor.handle_prepare(&req);
        if let Some(entry) = entry {
            acceptor.apply(entry);
        }
        Ok(reply)
    }

    async fn accept(
        &self,
        req: AcceptRequest,
    ) -> Result<AcceptResponse, SynleaseError> {
        self.gate().await?;
        let mut acceptor = self.acceptor.lock().unwrap();
        let (reply, entry) = acceptor.handle_accept(&req);
        if let Some(entry) = entry {
            acceptor.apply(entry);
        }
        Ok(reply)
    }
}

/// Lease with a deterministic expiry `secs` after the Unix epoch.
pub(crate) fn test_lease(owner: &'static [u8], secs: u64) -> Lease {
    Lease::new(
        Bytes::from_static(owner),
        UNIX_EPOCH + Duration::from_secs(secs),
        Bytes::new(),
    )
}
