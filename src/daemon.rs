//! Supervision loop
//!
//! One cooperative loop owns the scheduler and the supervisor. It waits for
//! whichever comes first: the served process exiting, the renewal ticker, a
//! pending restart, or an external trigger. Renewal passes never overlap.

use crate::error::SupervisorError;
use crate::process::{ProxySupervisor, UnexpectedExit};
use crate::scheduler::RenewalScheduler;
use crate::site::load_sites;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const DEFAULT_STARTUP_DELAY: Duration = Duration::from_secs(15);
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(3600);
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(5);

/// External events the loop reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Run a renewal pass now (still subject to the schedule guard)
    RenewalCheck,
    /// Reload the site directory and regenerate every config
    Rescan,
    /// Stop the served process and leave the loop
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub site_dir: PathBuf,
    /// Delay between the first start and the first scheduled pass
    pub startup_delay: Duration,
    pub check_interval: Duration,
    /// A process dying sooner than this after start is restarted only after
    /// waiting this long
    pub restart_backoff: Duration,
}

impl DaemonOptions {
    pub fn new(site_dir: impl Into<PathBuf>) -> Self {
        Self {
            site_dir: site_dir.into(),
            startup_delay: DEFAULT_STARTUP_DELAY,
            check_interval: DEFAULT_CHECK_INTERVAL,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
        }
    }
}

/// Run until a `Shutdown` trigger arrives or every trigger sender is gone.
///
/// Only the very first start of the served process is fatal; every later
/// failure is logged and retried.
pub async fn run(
    scheduler: &mut RenewalScheduler,
    supervisor: &mut ProxySupervisor,
    options: &DaemonOptions,
    mut triggers: mpsc::Receiver<Trigger>,
) -> Result<(), SupervisorError> {
    supervisor.ensure_running().await?;

    let mut ticker = interval_at(Instant::now() + options.startup_delay, options.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut restart_at: Option<Instant> = None;

    info!(
        startup_delay_secs = options.startup_delay.as_secs(),
        check_interval_secs = options.check_interval.as_secs(),
        "Supervision loop started"
    );

    loop {
        tokio::select! {
            exit = supervisor.wait_exit() => {
                restart_at = Some(restart_deadline(&exit, options.restart_backoff));
            }
            _ = sleep_until_opt(restart_at) => {
                restart_at = None;
                apply(supervisor, &mut restart_at, options.restart_backoff).await;
            }
            _ = ticker.tick() => {
                renewal_pass(scheduler, supervisor, &mut restart_at, options).await;
            }
            trigger = triggers.recv() => match trigger {
                Some(Trigger::RenewalCheck) => {
                    info!("Renewal check requested");
                    renewal_pass(scheduler, supervisor, &mut restart_at, options).await;
                }
                Some(Trigger::Rescan) => {
                    rescan(scheduler, supervisor, &mut restart_at, options).await;
                }
                Some(Trigger::Shutdown) | None => break,
            }
        }
    }

    info!("Shutting down");
    supervisor.stop().await;
    let stats = supervisor.stats();
    info!(
        starts = stats.starts,
        reloads = stats.reloads,
        unexpected_exits = stats.unexpected_exits,
        "Supervisor stopped"
    );
    Ok(())
}

fn restart_deadline(exit: &UnexpectedExit, backoff: Duration) -> Instant {
    if exit.uptime < backoff {
        warn!(backoff_secs = backoff.as_secs(), "Served process died right after start, backing off");
        Instant::now() + backoff
    } else {
        Instant::now()
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Reload a live process or start a dead one; a failed start is retried
/// after the back-off.
async fn apply(supervisor: &mut ProxySupervisor, restart_at: &mut Option<Instant>, backoff: Duration) {
    match supervisor.ensure_running().await {
        Ok(action) => debug!(?action, "Served process up to date"),
        Err(e) => {
            error!(error = %e, "Couldn't bring up served process");
            *restart_at = Some(Instant::now() + backoff);
        }
    }
}

async fn renewal_pass(
    scheduler: &mut RenewalScheduler,
    supervisor: &mut ProxySupervisor,
    restart_at: &mut Option<Instant>,
    options: &DaemonOptions,
) {
    let report = scheduler.run_pass().await;
    if !report.ran {
        return;
    }
    info!(
        renewed = report.renewed.len(),
        deferred = report.deferred.len(),
        "Renewal pass finished"
    );
    if report.reload_required {
        *restart_at = None;
        apply(supervisor, restart_at, options.restart_backoff).await;
    }
}

async fn rescan(
    scheduler: &mut RenewalScheduler,
    supervisor: &mut ProxySupervisor,
    restart_at: &mut Option<Instant>,
    options: &DaemonOptions,
) {
    info!(path = %options.site_dir.display(), "Rescanning site directory");
    match load_sites(&options.site_dir) {
        Ok(sites) => {
            scheduler.replace_sites(sites);
            let report = scheduler.init_config();
            info!(
                written = report.written.len(),
                failed = report.failed.len(),
                removed = report.removed.len(),
                "Site configs regenerated"
            );
            *restart_at = None;
            apply(supervisor, restart_at, options.restart_backoff).await;
        }
        Err(e) => error!(error = %e, "Couldn't rescan site directory, keeping current sites"),
    }
}

/// Turn process signals into triggers: SIGUSR1 runs a renewal check, SIGHUP
/// rescans, SIGTERM and Ctrl+C shut down.
pub fn spawn_signal_forwarder(tx: mpsc::Sender<Trigger>) -> std::io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        Ok(tokio::spawn(async move {
            loop {
                let trigger = tokio::select! {
                    _ = sigusr1.recv() => {
                        info!("Received SIGUSR1");
                        Trigger::RenewalCheck
                    }
                    _ = sighup.recv() => {
                        info!("Received SIGHUP");
                        Trigger::Rescan
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM");
                        Trigger::Shutdown
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C)");
                        Trigger::Shutdown
                    }
                };
                if tx.send(trigger).await.is_err() || trigger == Trigger::Shutdown {
                    break;
                }
            }
        }))
    }

    #[cfg(not(unix))]
    {
        Ok(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C");
                let _ = tx.send(Trigger::Shutdown).await;
            }
        }))
    }
}
