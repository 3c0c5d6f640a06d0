//! Actor that owns the monitor state.
//!
//! [`MonitorActor`] is the single owner of the [`ToolExecutor`] (and with it the
//! controller and scheduler). It runs in one Tokio task and multiplexes three sources:
//!
//! ```text
//! MonitorHandle ──MonitorCommand──┐
//! acquisition thread ──SessionEvent──┼──▶ MonitorActor ──▶ broadcast<ToolNotification>
//! ActionScheduler ──SchedulerDue──┘          (select!)
//! ```
//!
//! Every state change happens on that task, so no locks are needed around the buffer,
//! metadata or schedule. Results of scheduled work are published on a broadcast channel
//! for anyone who wants to observe them.
//!
//! # Example
//!
//! ```no_run
//! use capmon::actor::MonitorHandle;
//! use capmon::config::MonitorConfig;
//! use capmon::tools::ToolCall;
//!
//! # async fn example() -> capmon::error::MonitorResult<()> {
//! let handle = MonitorHandle::spawn(&MonitorConfig::default());
//! let status = handle.call(ToolCall::GetStatus).await?;
//! println!("{}", status.message);
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::MonitorConfig;
use crate::controller::ControllerEvent;
use crate::error::{MonitorError, MonitorResult};
use crate::measurement::Sample;
use crate::messages::MonitorCommand;
use crate::tools::{Pending, ToolCall, ToolExecutor, ToolNotification, ToolResult};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Command channel capacity.
pub const COMMAND_CAPACITY: usize = 32;

const NOTIFICATION_CAPACITY: usize = 256;

/// Runs tool calls and scheduled work against one [`ToolExecutor`].
pub struct MonitorActor {
    executor: ToolExecutor,
    notifications: broadcast::Sender<ToolNotification>,
}

impl MonitorActor {
    /// Wrap an executor; call [`run`](Self::run) to drive it.
    pub fn new(executor: ToolExecutor) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            executor,
            notifications,
        }
    }

    /// Receiver for results of scheduled tasks and sequence steps.
    pub fn notifications(&self) -> broadcast::Receiver<ToolNotification> {
        self.notifications.subscribe()
    }

    /// Process commands, worker events and due scheduler work until shutdown.
    ///
    /// Exits when a `Shutdown` command arrives or every command sender is dropped; in
    /// both cases the running session is stopped first.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<MonitorCommand>) {
        info!("MonitorActor started");

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(MonitorCommand::Shutdown { response }) => {
                            info!("Shutdown command received");
                            self.executor.shutdown().await;
                            let _ = response.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            info!("All handles dropped, shutting down");
                            self.executor.shutdown().await;
                            break;
                        }
                    }
                }

                pending = self.executor.next_pending() => {
                    match pending {
                        Pending::Worker(event) => {
                            self.executor.controller_mut().handle_worker_event(event);
                        }
                        Pending::Due(due) => {
                            for notification in self.executor.run_due(due).await {
                                debug!(tool = %notification.tool, success = notification.result.success, "Scheduled action done");
                                let _ = self.notifications.send(notification);
                            }
                        }
                    }
                }
            }
        }

        info!("MonitorActor stopped");
    }

    async fn handle_command(&mut self, command: MonitorCommand) {
        match command {
            MonitorCommand::Call { call, response } => {
                let result = self.executor.call(call).await;
                let _ = response.send(result);
            }
            MonitorCommand::GetSamples {
                window_seconds,
                response,
            } => {
                let controller = self.executor.controller();
                let samples = match window_seconds {
                    Some(seconds) => controller.samples_in_window(seconds),
                    None => controller.samples(),
                };
                let _ = response.send(samples);
            }
            MonitorCommand::GetOverlay { response } => {
                let _ = response.send(self.executor.controller().overlay().to_vec());
            }
            MonitorCommand::SubscribeEvents { response } => {
                let _ = response.send(self.executor.controller().subscribe());
            }
            MonitorCommand::Shutdown { response } => {
                let _ = response.send(());
            }
        }
    }
}

/// Cloneable front end to a running [`MonitorActor`].
#[derive(Clone)]
pub struct MonitorHandle {
    command_tx: mpsc::Sender<MonitorCommand>,
    notifications: broadcast::Sender<ToolNotification>,
}

impl MonitorHandle {
    /// Build the executor from `config` and spawn the actor on the current runtime.
    pub fn spawn(config: &MonitorConfig) -> Self {
        Self::spawn_with(ToolExecutor::from_config(config)).0
    }

    /// Spawn an actor around an existing executor.
    pub fn spawn_with(executor: ToolExecutor) -> (Self, JoinHandle<()>) {
        let actor = MonitorActor::new(executor);
        let notifications = actor.notifications.clone();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let task = tokio::spawn(actor.run(command_rx));
        (
            Self {
                command_tx,
                notifications,
            },
            task,
        )
    }

    /// Run one tool call.
    pub async fn call(&self, call: ToolCall) -> MonitorResult<ToolResult> {
        let (cmd, rx) = MonitorCommand::call(call);
        self.send(cmd).await?;
        rx.await.map_err(|_| MonitorError::ActorUnavailable)
    }

    /// Copy live samples, optionally only the trailing `window_seconds`.
    pub async fn samples(&self, window_seconds: Option<f64>) -> MonitorResult<Vec<Sample>> {
        let (cmd, rx) = MonitorCommand::get_samples(window_seconds);
        self.send(cmd).await?;
        rx.await.map_err(|_| MonitorError::ActorUnavailable)
    }

    /// Copy the loaded overlay samples.
    pub async fn overlay(&self) -> MonitorResult<Vec<Sample>> {
        let (cmd, rx) = MonitorCommand::get_overlay();
        self.send(cmd).await?;
        rx.await.map_err(|_| MonitorError::ActorUnavailable)
    }

    /// Controller events: samples, status lines, errors and session boundaries.
    pub async fn subscribe_events(&self) -> MonitorResult<broadcast::Receiver<ControllerEvent>> {
        let (cmd, rx) = MonitorCommand::subscribe_events();
        self.send(cmd).await?;
        rx.await.map_err(|_| MonitorError::ActorUnavailable)
    }

    /// Results of scheduled tasks and sequence steps.
    pub fn notifications(&self) -> broadcast::Receiver<ToolNotification> {
        self.notifications.subscribe()
    }

    /// Stop the actor, waiting until the controller has shut down.
    pub async fn shutdown(&self) -> MonitorResult<()> {
        let (cmd, rx) = MonitorCommand::shutdown();
        self.send(cmd).await?;
        rx.await.map_err(|_| MonitorError::ActorUnavailable)
    }

    async fn send(&self, command: MonitorCommand) -> MonitorResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| MonitorError::ActorUnavailable)
    }
}
