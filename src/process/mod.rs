//! Handler process management.
//!
//! Spawns handler executables with the message payload as argument, the
//! triggering topic and message id in the environment, and the write end of
//! a private command pipe on file descriptor 3.

mod registry;

pub use registry::{HandleId, ProcessHandle, ProcessRegistry, RegistryError};

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::libc;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Environment variable carrying the triggering message's topic.
pub const TOPIC_ENV_VAR: &str = "MQTT_TOPIC";
/// Environment variable carrying the triggering message's id.
pub const MESSAGE_ID_ENV_VAR: &str = "MQTT_MSGID";
/// Descriptor handlers write commands to.
pub const COMMAND_FD: RawFd = 3;

const SPAWN_ATTEMPTS: u32 = 3;
const TEXT_BUSY_DELAY: Duration = Duration::from_millis(20);

/// Errors that can occur while starting a handler.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Failed to create command pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("Failed to spawn '{executable}': {source}")]
    Spawn {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Environment variables passed to spawned handlers.
pub struct HandlerEnv {
    /// Topic of the message that triggered the handler.
    pub topic: String,
    /// Id of the message that triggered the handler.
    pub message_id: u16,
}

impl HandlerEnv {
    /// Convert to environment variable map.
    pub fn to_env_vars(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert(TOPIC_ENV_VAR.to_string(), self.topic.clone());
        env.insert(MESSAGE_ID_ENV_VAR.to_string(), self.message_id.to_string());
        env
    }
}

/// A running handler with its command pipe.
pub struct HandlerProcess {
    child: Child,
    handle: ProcessHandle,
    commands: Option<pipe::Receiver>,
    executable: PathBuf,
}

impl HandlerProcess {
    /// Spawn `executable` with `payload` as its single argument.
    ///
    /// The dispatcher's environment is inherited and extended with `env`.
    /// Standard output and error are inherited so handler output shows up
    /// next to the dispatcher's logs.
    pub async fn spawn(
        executable: &Path,
        payload: &[u8],
        working_dir: &Path,
        env: &HandlerEnv,
    ) -> Result<Self, SpawnError> {
        // Both ends are close-on-exec; only the dup on COMMAND_FD is inherited
        let (read_end, write_end) = io::pipe().map_err(SpawnError::Pipe)?;
        let commands =
            pipe::Receiver::from_owned_fd(OwnedFd::from(read_end)).map_err(SpawnError::Pipe)?;

        let mut cmd = Command::new(executable);
        cmd.arg(OsStr::from_bytes(payload))
            .current_dir(working_dir)
            .envs(env.to_env_vars())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let write_fd = write_end.as_raw_fd();
        // SAFETY: only async-signal-safe fd syscalls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || attach_command_fd(write_fd));
        }

        let mut attempt = 1;
        let spawned = loop {
            match cmd.spawn() {
                // A handler installed a moment ago may still be open for
                // writing in a concurrently forked process.
                Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_ATTEMPTS => {
                    debug!(executable = %executable.display(), attempt, "Executable busy, retrying");
                    attempt += 1;
                    tokio::time::sleep(TEXT_BUSY_DELAY).await;
                }
                result => break result,
            }
        };
        // The child holds its own copy; closing ours lets the reader see EOF
        // once the handler exits.
        drop(write_end);

        let child = spawned.map_err(|source| SpawnError::Spawn {
            executable: executable.to_path_buf(),
            source,
        })?;

        let handle = ProcessHandle::new(child.id());
        info!(
            executable = %executable.display(),
            payload = %String::from_utf8_lossy(payload),
            pid = ?handle.pid(),
            "executing"
        );

        Ok(Self {
            child,
            handle,
            commands: Some(commands),
            executable: executable.to_path_buf(),
        })
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Take the read end of the command pipe. Returns `None` after the first call.
    pub fn take_commands(&mut self) -> Option<pipe::Receiver> {
        self.commands.take()
    }

    /// Wait for the process to exit.
    ///
    /// Kill requests on the handle are delivered while waiting. With a
    /// `timeout`, a process still running when it elapses is killed the
    /// same way.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> io::Result<ExitStatus> {
        let deadline = async move {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);
        let mut timed_out = false;

        loop {
            tokio::select! {
                status = self.child.wait() => return status,
                _ = self.handle.kill_requested() => {
                    self.start_kill();
                }
                _ = &mut deadline, if !timed_out => {
                    timed_out = true;
                    warn!(
                        executable = %self.executable.display(),
                        pid = ?self.handle.pid(),
                        "Handler timed out"
                    );
                    self.start_kill();
                }
            }
        }
    }

    fn start_kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(pid = ?self.handle.pid(), error = %e, "Failed to kill handler");
        }
    }
}

/// Runs in the forked child: expose the pipe's write end as `COMMAND_FD`.
fn attach_command_fd(fd: RawFd) -> io::Result<()> {
    if fd == COMMAND_FD {
        // dup2 onto itself keeps close-on-exec, clear it instead
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    } else {
        nix::unistd::dup2(fd, COMMAND_FD)?;
    }
    Ok(())
}
