//! Message types for actor-based communication.
//!
//! Commands are sent to the [`MonitorActor`](crate::actor::MonitorActor) over an mpsc
//! channel. Each variant carries a oneshot sender for its response, so callers always
//! get exactly one reply per command.
//!
//! ```text
//! Caller                             Actor Task
//! ------                             ----------
//! 1. Create command with oneshot
//! 2. Send via mpsc channel    ------>
//!                                    3. Receive command
//!                                    4. Run tool on executor
//!                                    5. Send response
//! 6. Await oneshot receiver   <------
//! ```
//!
//! Each variant has a helper that builds the command and returns the receiver:
//!
//! ```rust
//! use capmon::messages::MonitorCommand;
//! use capmon::tools::ToolCall;
//!
//! let (cmd, rx) = MonitorCommand::call(ToolCall::GetStatus);
//! // cmd_tx.send(cmd).await?;
//! // let result = rx.await?;
//! ```

use crate::controller::ControllerEvent;
use crate::measurement::Sample;
use crate::tools::{ToolCall, ToolResult};
use tokio::sync::{broadcast, oneshot};

/// Commands accepted by the monitor actor.
#[derive(Debug)]
pub enum MonitorCommand {
    /// Run one tool call.
    Call {
        /// Call to run
        call: ToolCall,
        /// Result of the call
        response: oneshot::Sender<ToolResult>,
    },

    /// Copy live samples, optionally only the trailing window in seconds.
    GetSamples {
        /// Trailing window; `None` for the whole buffer
        window_seconds: Option<f64>,
        /// Copied samples
        response: oneshot::Sender<Vec<Sample>>,
    },

    /// Copy the loaded overlay samples.
    GetOverlay {
        /// Copied overlay
        response: oneshot::Sender<Vec<Sample>>,
    },

    /// Subscribe to controller events (samples, status, errors).
    SubscribeEvents {
        /// New event receiver
        response: oneshot::Sender<broadcast::Receiver<ControllerEvent>>,
    },

    /// Stop any session, cancel scheduled work and exit the actor loop.
    ///
    /// The response is sent after the controller has shut down.
    Shutdown {
        /// Signalled once shutdown is complete
        response: oneshot::Sender<()>,
    },
}

impl MonitorCommand {
    /// Create a `Call` command.
    pub fn call(call: ToolCall) -> (Self, oneshot::Receiver<ToolResult>) {
        let (tx, rx) = oneshot::channel();
        (Self::Call { call, response: tx }, rx)
    }

    /// Create a `GetSamples` command.
    pub fn get_samples(window_seconds: Option<f64>) -> (Self, oneshot::Receiver<Vec<Sample>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::GetSamples {
                window_seconds,
                response: tx,
            },
            rx,
        )
    }

    /// Create a `GetOverlay` command.
    pub fn get_overlay() -> (Self, oneshot::Receiver<Vec<Sample>>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetOverlay { response: tx }, rx)
    }

    /// Create a `SubscribeEvents` command.
    pub fn subscribe_events() -> (
        Self,
        oneshot::Receiver<broadcast::Receiver<ControllerEvent>>,
    ) {
        let (tx, rx) = oneshot::channel();
        (Self::SubscribeEvents { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
