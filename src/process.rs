use crate::error::{ConfigError, SupervisorError};
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Command line used to start the served process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCommand {
    program: String,
    args: Vec<String>,
}

impl ProxyCommand {
    /// Split `command` with shell quoting rules
    pub fn parse(command: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::ProxyCommand {
            command: command.to_string(),
            reason,
        };
        let mut words = shell_words::split(command).map_err(|e| invalid(e.to_string()))?;
        if words.is_empty() {
            return Err(invalid("command is empty".to_string()));
        }
        let program = words.remove(0);
        Ok(Self { program, args: words })
    }

    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for ProxyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&shell_words::join(std::iter::once(&self.program).chain(&self.args)))
    }
}

/// What `ensure_running` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureAction {
    Started,
    Reloaded,
}

/// Lifetime counters of the supervisor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub starts: u64,
    pub reloads: u64,
    pub unexpected_exits: u64,
}

/// How the served process ended when nobody asked it to
#[derive(Debug, Clone, Copy)]
pub struct UnexpectedExit {
    pub status: Option<ExitStatus>,
    /// Time between spawn and exit
    pub uptime: Duration,
}

/// Owns the single handle to the served process.
///
/// The process is either absent (must be started) or running. A running
/// process that is still alive is reloaded in place; one that died is
/// replaced by a fresh process.
pub struct ProxySupervisor {
    command: ProxyCommand,
    child: Option<Child>,
    started_at: Instant,
    shutdown_grace: Duration,
    stats: SupervisorStats,
}

impl ProxySupervisor {
    pub fn new(command: ProxyCommand, shutdown_grace: Duration) -> Self {
        Self {
            command,
            child: None,
            started_at: Instant::now(),
            shutdown_grace,
            stats: SupervisorStats::default(),
        }
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Non-blocking liveness check
    pub fn is_running(&mut self) -> bool {
        self.poll_exit();
        self.child.is_some()
    }

    /// Start the process if it is absent or dead, reload it otherwise.
    pub async fn ensure_running(&mut self) -> Result<EnsureAction, SupervisorError> {
        if self.poll_exit().is_none() && self.child.is_some() {
            match self.reload().await {
                Ok(true) => return Ok(EnsureAction::Reloaded),
                Ok(false) => {}
                Err(e) => return Err(e),
            }
        }
        self.start()?;
        Ok(EnsureAction::Started)
    }

    /// Reap the child if it has exited. Clears the handle and counts the
    /// exit as unexpected.
    pub fn poll_exit(&mut self) -> Option<UnexpectedExit> {
        let child = self.child.as_mut()?;
        let status = match child.try_wait() {
            Ok(Some(status)) => Some(status),
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Couldn't poll served process, assuming it died");
                None
            }
        };
        Some(self.record_exit(status))
    }

    /// Resolve when the child exits; never resolves while there is no child.
    pub async fn wait_exit(&mut self) -> UnexpectedExit {
        let Some(child) = self.child.as_mut() else {
            return std::future::pending().await;
        };
        let status = match child.wait().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(error = %e, "Error waiting for served process");
                None
            }
        };
        self.record_exit(status)
    }

    /// SIGTERM, wait up to the grace period, then kill
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Some(pid) = child.id() {
            info!(pid, "Sending SIGTERM to served process");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => info!(?status, "Served process exited"),
            Ok(Err(e)) => warn!(error = %e, "Error waiting for served process to exit"),
            Err(_) => {
                warn!(
                    grace_period_secs = self.shutdown_grace.as_secs(),
                    "Grace period exceeded, killing served process"
                );
                let _ = child.kill().await;
            }
        }
    }

    fn start(&mut self) -> Result<(), SupervisorError> {
        info!(command = %self.command, "Starting served process");

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args);
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: self.command.program.clone(),
            source,
        })?;
        info!(pid = child.id().unwrap_or(0), "Served process spawned");

        self.child = Some(child);
        self.started_at = Instant::now();
        self.stats.starts += 1;
        Ok(())
    }

    /// Ask the live process to re-read its configuration. `Ok(false)` means
    /// the process turned out to be gone and must be started instead.
    #[cfg(unix)]
    async fn reload(&mut self) -> Result<bool, SupervisorError> {
        let Some(pid) = self.pid() else {
            self.record_exit(None);
            return Ok(false);
        };
        debug!(pid, "Sending SIGHUP to served process");
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGHUP) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                self.record_exit(None);
                return Ok(false);
            }
            return Err(SupervisorError::Signal { pid, source: err });
        }
        info!(pid, "Served process reloaded");
        self.stats.reloads += 1;
        Ok(true)
    }

    #[cfg(not(unix))]
    async fn reload(&mut self) -> Result<bool, SupervisorError> {
        self.stop().await;
        self.start()?;
        self.stats.reloads += 1;
        Ok(true)
    }

    fn record_exit(&mut self, status: Option<ExitStatus>) -> UnexpectedExit {
        self.child = None;
        self.stats.unexpected_exits += 1;
        let uptime = self.started_at.elapsed();
        error!(
            critical = true,
            code = status.and_then(|s| s.code()),
            ?status,
            uptime_secs = uptime.as_secs(),
            "Served process died"
        );
        UnexpectedExit { status, uptime }
    }
}
