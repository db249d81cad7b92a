use clap::Parser;
use rproxy::config::{BackendChoice, Cli, Mode, Settings};
use rproxy::daemon::{self, Trigger};
use rproxy::scheduler::RenewalScheduler;
use rproxy::site::load_sites;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("rproxy={}", cli.log_level())));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::from_cli(cli)?;
    info!(
        mode = ?settings.mode,
        sites = %settings.site_dir.display(),
        conf_dir = %settings.conf_dir.display(),
        document_root = %settings.document_root.display(),
        "Starting rproxy"
    );

    let writer = settings.writer()?;
    settings.ensure_challenge_dir()?;

    if settings.testing {
        if let BackendChoice::Acme { directory_url } = &settings.backend {
            warn!(directory = %directory_url, "Using ACME staging directory!");
        }
    }

    let sites = load_sites(&settings.site_dir)?;
    info!(count = sites.len(), "Sites loaded");

    let report = writer.clean_and_configure_all(&sites);
    info!(
        written = report.written.len(),
        failed = report.failed.len(),
        removed = report.removed.len(),
        "Site configs generated"
    );

    if settings.mode == Mode::Init {
        return Ok(());
    }

    let mut scheduler = RenewalScheduler::new(settings.issuer()?, writer, sites);
    let mut supervisor = settings.supervisor();

    let (tx, rx) = mpsc::channel::<Trigger>(8);
    let signals = daemon::spawn_signal_forwarder(tx)?;

    let result = daemon::run(&mut scheduler, &mut supervisor, &settings.daemon_options(), rx).await;
    signals.abort();
    result?;

    info!("Shutdown complete");
    Ok(())
}
