//! One-shot device permission exchange.
//!
//! The party that shows a prompt holds the [`PermissionResponder`]; the flow
//! waiting on the answer holds the [`PermissionRequest`]. Dropping the
//! responder without answering counts as a denial.

use log::debug;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Granted,
    Denied,
}

pub struct PermissionResponder {
    device: String,
    tx: oneshot::Sender<PermissionDecision>,
}

pub struct PermissionRequest {
    device: String,
    rx: oneshot::Receiver<PermissionDecision>,
}

/// Create a linked request/responder pair for `device`
pub fn permission_channel(device: impl Into<String>) -> (PermissionResponder, PermissionRequest) {
    let device = device.into();
    let (tx, rx) = oneshot::channel();
    (
        PermissionResponder {
            device: device.clone(),
            tx,
        },
        PermissionRequest { device, rx },
    )
}

impl PermissionResponder {
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn respond(self, decision: PermissionDecision) {
        debug!("permission for {}: {:?}", self.device, decision);
        // receiver gone: nobody waits for the answer any more
        let _ = self.tx.send(decision);
    }

    pub fn grant(self) {
        self.respond(PermissionDecision::Granted)
    }

    pub fn deny(self) {
        self.respond(PermissionDecision::Denied)
    }
}

impl PermissionRequest {
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Resolves once the responder answers or is dropped
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(PermissionDecision::Granted) => Ok(()),
            Ok(PermissionDecision::Denied) | Err(_) => Err(Error::PermissionDenied(self.device)),
        }
    }
}
