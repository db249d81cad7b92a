use crate::acme::AcmeBackend;
use crate::daemon::{DaemonOptions, DEFAULT_RESTART_BACKOFF};
use crate::error::ConfigError;
use crate::external::CommandBackend;
use crate::issuer::{CertBackend, CertificateIssuer, CHALLENGE_PATH};
use crate::process::{ProxyCommand, ProxySupervisor};
use crate::render::Renderer;
use crate::writer::ConfigWriter;
use clap::{Parser, ValueEnum};
use instant_acme::LetsEncrypt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// What to do after the configs are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Render every site config once and exit
    Init,
    /// Render every site config, then supervise the proxy and renew certificates
    Run,
}

/// Keep nginx site configs and their certificates up to date.
#[derive(Parser, Debug)]
#[command(name = "rproxy", version, about)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Directory holding http.conf.tmpl and https.conf.tmpl
    #[arg(short = 't', long = "templates", env = "RPROXY_TEMPLATES", default_value = "templates")]
    pub templates: PathBuf,

    /// Directory with one subdirectory per site
    #[arg(short = 'c', long = "vhostdir", env = "RPROXY_VHOSTDIR", default_value = "vhost")]
    pub vhost_dir: PathBuf,

    /// Directory the rendered site configs are written to
    #[arg(short = 'n', long = "nginxconfd", env = "RPROXY_NGINXCONFD", default_value = "/etc/nginx/conf.d")]
    pub nginx_conf_dir: PathBuf,

    /// Document root serving ACME challenge files
    #[arg(short = 'r', long, env = "RPROXY_DOCUMENT_ROOT", default_value = "webroot")]
    pub document_root: PathBuf,

    /// Use the staging ACME directory
    #[arg(long, env = "RPROXY_TESTING")]
    pub testing: bool,

    /// ACME directory URL, overriding the Let's Encrypt default
    #[arg(long, env = "RPROXY_ACME_DIRECTORY")]
    pub acme_directory: Option<String>,

    /// Issue through an external ACME client (e.g. simp_le) instead of the built-in one
    #[arg(long, env = "RPROXY_ACME_COMMAND")]
    pub acme_command: Option<String>,

    /// Command starting the served process in the foreground
    #[arg(long, env = "RPROXY_PROXY_COMMAND", default_value = "nginx -g 'daemon off;'")]
    pub proxy_command: String,

    /// Seconds between the first start and the first renewal check
    #[arg(long, env = "RPROXY_STARTUP_DELAY", default_value_t = 15)]
    pub startup_delay: u64,

    /// Seconds between renewal checks
    #[arg(long, env = "RPROXY_CHECK_INTERVAL", default_value_t = 3600)]
    pub check_interval: u64,

    /// Renew certificates expiring within this many days
    #[arg(long, env = "RPROXY_RENEW_BEFORE_DAYS", default_value_t = 30)]
    pub renew_before_days: u32,

    /// Seconds the served process gets to exit before it is killed
    #[arg(long, env = "RPROXY_SHUTDOWN_GRACE", default_value_t = 10)]
    pub shutdown_grace: u64,

    #[arg(value_enum)]
    pub mode: Mode,
}

impl Cli {
    /// Default tracing directive for the `-v` count
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }
}

/// How certificates are obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendChoice {
    Acme { directory_url: String },
    Command(String),
}

/// Validated startup configuration
#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: Mode,
    pub template_dir: PathBuf,
    pub site_dir: PathBuf,
    pub conf_dir: PathBuf,
    pub document_root: PathBuf,
    pub testing: bool,
    pub backend: BackendChoice,
    pub proxy_command: ProxyCommand,
    pub startup_delay: Duration,
    pub check_interval: Duration,
    pub renew_before_days: u32,
    pub shutdown_grace: Duration,
}

impl Settings {
    /// Validate the command line. Every error here is fatal.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let conf_dir = existing_dir("nginx config directory", &cli.nginx_conf_dir)?;
        let document_root = existing_dir("document root", &cli.document_root)?;
        let site_dir = existing_dir("site directory", &cli.vhost_dir)?;
        std::fs::read_dir(&site_dir).map_err(|source| ConfigError::SiteDirectory {
            path: site_dir.clone(),
            source,
        })?;

        let proxy_command = ProxyCommand::parse(&cli.proxy_command)?;

        let backend = match cli.acme_command {
            Some(command) => {
                command_backend(&command, &document_root, cli.testing)?;
                BackendChoice::Command(command)
            }
            None => BackendChoice::Acme {
                directory_url: cli.acme_directory.unwrap_or_else(|| {
                    let directory = if cli.testing {
                        LetsEncrypt::Staging
                    } else {
                        LetsEncrypt::Production
                    };
                    directory.url().to_string()
                }),
            },
        };

        Ok(Self {
            mode: cli.mode,
            template_dir: cli.templates,
            site_dir,
            conf_dir,
            document_root,
            testing: cli.testing,
            backend,
            proxy_command,
            startup_delay: Duration::from_secs(cli.startup_delay),
            check_interval: Duration::from_secs(cli.check_interval.max(1)),
            renew_before_days: cli.renew_before_days,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace),
        })
    }

    pub fn challenge_dir(&self) -> PathBuf {
        self.document_root.join(CHALLENGE_PATH)
    }

    pub fn ensure_challenge_dir(&self) -> Result<PathBuf, ConfigError> {
        let dir = self.challenge_dir();
        std::fs::create_dir_all(&dir).map_err(|source| ConfigError::ChallengeDirectory {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    /// Load both templates; an unknown placeholder fails here rather than at
    /// render time
    pub fn writer(&self) -> Result<ConfigWriter, ConfigError> {
        let renderer = Renderer::load(&self.template_dir, &self.document_root)?;
        Ok(ConfigWriter::new(&self.conf_dir, renderer))
    }

    pub fn cert_backend(&self) -> Result<Arc<dyn CertBackend>, ConfigError> {
        let backend: Arc<dyn CertBackend> = match &self.backend {
            BackendChoice::Acme { directory_url } => Arc::new(AcmeBackend::new(directory_url.clone())),
            BackendChoice::Command(command) => {
                Arc::new(command_backend(command, &self.document_root, self.testing)?)
            }
        };
        Ok(backend)
    }

    pub fn issuer(&self) -> Result<CertificateIssuer, ConfigError> {
        Ok(CertificateIssuer::new(self.cert_backend()?, &self.document_root)
            .with_renew_before_days(self.renew_before_days))
    }

    pub fn supervisor(&self) -> ProxySupervisor {
        ProxySupervisor::new(self.proxy_command.clone(), self.shutdown_grace)
    }

    pub fn daemon_options(&self) -> DaemonOptions {
        DaemonOptions {
            site_dir: self.site_dir.clone(),
            startup_delay: self.startup_delay,
            check_interval: self.check_interval,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
        }
    }
}

fn command_backend(command: &str, document_root: &Path, testing: bool) -> Result<CommandBackend, ConfigError> {
    CommandBackend::new(command, document_root, testing).map_err(|reason| ConfigError::AcmeCommand {
        command: command.to_string(),
        reason,
    })
}

/// Canonical path of a directory that must already exist
fn existing_dir(what: &'static str, path: &Path) -> Result<PathBuf, ConfigError> {
    let not_a_dir = || ConfigError::NotADirectory {
        what,
        path: path.to_path_buf(),
    };
    if !path.is_dir() {
        return Err(not_a_dir());
    }
    std::fs::canonicalize(path).map_err(|_| not_a_dir())
}
