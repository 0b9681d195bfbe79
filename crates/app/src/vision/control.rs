//! Command channel between the HTTP control surface and the controller.
//!
//! Requests travel over an unbounded crossbeam channel that the controller
//! drains at the top of every iteration; each request carries a oneshot the
//! controller answers once the command has been applied or rejected. A
//! request whose caller has already timed out is dropped without being
//! applied, so a 503 never hides a state change.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::vision::data::Command;

/// How long the HTTP layer waits for the controller to answer.
pub(crate) const CONTROL_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub(crate) enum CommandError {
    #[error("invalid {param}: {reason}")]
    InvalidValue { param: &'static str, reason: String },
    #[error("unknown tracker backend {name:?} (available: {available})")]
    UnknownTracker { name: String, available: String },
    #[error("camera control failed: {0}")]
    Camera(String),
    #[error("controller did not answer within {0:?}")]
    Timeout(Duration),
    #[error("controller is not running")]
    Unavailable,
}

impl CommandError {
    /// Rejections caused by the request itself rather than the pipeline.
    pub(crate) fn is_rejection(&self) -> bool {
        matches!(
            self,
            CommandError::InvalidValue { .. } | CommandError::UnknownTracker { .. }
        )
    }
}

pub(crate) struct ControlRequest {
    pub(crate) command: Command,
    pub(crate) reply: oneshot::Sender<Result<String, CommandError>>,
}

#[derive(Clone)]
pub(crate) struct ControlHandle {
    tx: Sender<ControlRequest>,
    timeout: Duration,
}

impl ControlHandle {
    /// Queue `command` and wait for the controller's verdict.
    pub(crate) async fn send(&self, command: Command) -> Result<String, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlRequest { command, reply })
            .map_err(|_| CommandError::Unavailable)?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CommandError::Unavailable),
            Err(_) => Err(CommandError::Timeout(self.timeout)),
        }
    }
}

pub(crate) fn control_channel(timeout: Duration) -> (ControlHandle, Receiver<ControlRequest>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (ControlHandle { tx, timeout }, rx)
}
