//! Inbound message dispatch.
//!
//! Each inbound message is handled as its own unit of work:
//! route, spawn the handler with its command pipe, register it, drain its
//! commands concurrently, wait for exit, unregister.
//!
//! ```text
//! bus ──message──> Dispatcher ──route──> Router
//!                      │
//!                      ├── spawn handler (payload arg, MQTT_* env, fd 3 pipe)
//!                      ├── register in ProcessRegistry
//!                      ├── drain task: PUB ──> bus.publish
//!                      │               KILL ──> registry.kill_topic(except self)
//!                      ├── wait for exit
//!                      └── unregister
//! ```

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::io::AsyncRead;
use tracing::{debug, error, info, warn};

use crate::bus::{InboundMessage, MessageBus, MessageHandler, OutboundMessage};
use crate::process::{HandlerEnv, HandlerProcess, ProcessHandle, ProcessRegistry, SpawnError};
use crate::protocol::{Command, ProtoReader};
use crate::router::{RouteError, Router};

/// Dispatcher configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Kill handlers still running after this many seconds. Unset means
    /// handlers run until they exit or are killed by a sibling.
    pub handler_timeout_secs: Option<u64>,
}

impl DispatcherConfig {
    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_secs.map(Duration::from_secs)
    }
}

/// Errors that end the handling of one message.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("can't route message: {0}")]
    Route(#[from] RouteError),

    #[error("can't resolve handler path '{path}': {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("{executable}: failed waiting for exit: {source}")]
    Wait {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What happened to a message.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// No handler is configured for the topic.
    NoRoute,
    /// A handler ran and exited.
    Exited {
        executable: PathBuf,
        pid: Option<u32>,
        status: ExitStatus,
    },
}

/// Routes inbound messages to handler processes.
#[derive(Clone)]
pub struct Dispatcher {
    router: Router,
    bus: Arc<dyn MessageBus>,
    registry: Arc<ProcessRegistry>,
    handler_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(router: Router, bus: Arc<dyn MessageBus>, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            router,
            bus,
            registry,
            handler_timeout: None,
        }
    }

    /// Kill handlers that run longer than `timeout`.
    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Handle one message to completion.
    ///
    /// Returns after the handler exited and was unregistered. The handler's
    /// command drain may still be finishing in the background.
    pub async fn dispatch(&self, message: &InboundMessage) -> Result<DispatchOutcome, DispatchError> {
        let Some(route) = self.router.route(&message.topic).await? else {
            return Ok(DispatchOutcome::NoRoute);
        };
        // The child runs inside the routes directory, so a relative path
        // would be ambiguous.
        let executable = std::path::absolute(&route).map_err(|source| DispatchError::Resolve {
            path: route.clone(),
            source,
        })?;

        let env = HandlerEnv {
            topic: message.topic.clone(),
            message_id: message.message_id,
        };
        let mut process =
            HandlerProcess::spawn(&executable, &message.payload, self.router.dir(), &env).await?;
        let handle = process.handle().clone();

        if let Err(e) = self.registry.register(handle.clone(), &message.topic).await {
            error!(error = %e, "Failed to register handler");
        }

        if let Some(commands) = process.take_commands() {
            tokio::spawn(drain_commands(
                commands,
                handle.clone(),
                Arc::clone(&self.bus),
                Arc::clone(&self.registry),
            ));
        }

        let waited = process.wait(self.handler_timeout).await;
        self.registry.unregister(handle.id()).await;

        let status = waited.map_err(|source| DispatchError::Wait {
            executable: executable.clone(),
            source,
        })?;

        Ok(DispatchOutcome::Exited {
            executable,
            pid: handle.pid(),
            status,
        })
    }

    /// Dispatch and log the result. Errors never propagate past one message.
    pub async fn handle_message(&self, message: &InboundMessage) {
        match self.dispatch(message).await {
            Ok(DispatchOutcome::NoRoute) => {
                debug!(topic = %message.topic, "No handler for topic");
            }
            Ok(DispatchOutcome::Exited {
                executable,
                pid,
                status,
            }) => {
                if status.success() {
                    debug!(executable = %executable.display(), pid = ?pid, "Handler exited");
                } else {
                    warn!(
                        executable = %executable.display(),
                        pid = ?pid,
                        status = %status,
                        "Handler failed"
                    );
                }
            }
            Err(e) => {
                error!(topic = %message.topic, error = %e, "Dropped message");
            }
        }
    }
}

impl MessageHandler for Dispatcher {
    fn handle(&self, message: Arc<InboundMessage>) -> BoxFuture<'static, ()> {
        let dispatcher = self.clone();
        Box::pin(async move { dispatcher.handle_message(&message).await })
    }
}

/// Act on the commands a handler writes until it closes the pipe.
///
/// A malformed command ends command handling for this handler only. The
/// pipe stays open until the handler closes it, so later writes to fd 3
/// do not raise SIGPIPE in the handler.
async fn drain_commands<R>(
    reader: R,
    handle: ProcessHandle,
    bus: Arc<dyn MessageBus>,
    registry: Arc<ProcessRegistry>,
) where
    R: AsyncRead + Unpin,
{
    let mut proto = ProtoReader::new(reader);
    loop {
        let command = match proto.next_command().await {
            Ok(Some(command)) => command,
            Ok(None) => break,
            Err(e) => {
                warn!(pid = ?handle.pid(), error = %e, "invalid input");
                discard_remaining(proto.into_inner(), &handle).await;
                return;
            }
        };

        info!(pid = ?handle.pid(), "{}", command);

        match command {
            Command::Publish {
                topic,
                qos,
                payload,
            } => {
                let message = OutboundMessage {
                    topic,
                    qos,
                    payload,
                    retain: false,
                };
                if let Err(e) = bus.publish(message).await {
                    error!(pid = ?handle.pid(), error = %e, "Failed to publish handler message");
                }
            }
            Command::Kill { topic } => {
                let killed = registry.kill_topic(&topic, Some(handle.id())).await;
                debug!(topic = %topic, killed, "Kill requested by handler");
            }
        }
    }
}

/// Read and drop everything up to end of stream.
async fn discard_remaining<R>(mut reader: R, handle: &ProcessHandle)
where
    R: AsyncRead + Unpin,
{
    match tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
        Ok(dropped) => debug!(pid = ?handle.pid(), dropped, "Discarded handler output"),
        Err(e) => debug!(pid = ?handle.pid(), error = %e, "Command pipe read failed"),
    }
}
