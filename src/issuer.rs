//! Certificate issuance for one site
//!
//! The issuance backend speaks a small request/response protocol: it may ask
//! the caller to agree to terms of service, or to publish challenge files
//! below the document root, before it can issue. [`CertificateIssuer`]
//! drives that exchange, bounds the number of rounds, and turns every
//! failure into an [`IssueOutcome`] so that one site can never abort a
//! renewal pass for the others.

use crate::certificate::{self, DEFAULT_RENEW_BEFORE_DAYS};
use crate::error::CertGenerationError;
use crate::site::Site;
use crate::writer::write_atomic;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Path below the document root that HTTP-01 validation fetches from
pub const CHALLENGE_PATH: &str = ".well-known/acme-challenge";

/// Agreement or challenge-file requests allowed within one attempt
pub const MAX_ACTION_ROUNDS: u32 = 2;

/// A file the backend wants served to prove domain control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeFile {
    pub name: String,
    pub content: String,
}

/// Everything a backend needs to issue for one site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest {
    pub site: String,
    pub domains: Vec<String>,
    pub contact_email: String,
    pub certificate_file: PathBuf,
    pub private_key_file: PathBuf,
    /// Private per-site directory for account and order state
    pub state_dir: PathBuf,
    /// Terms-of-service URL the caller agreed to, if asked
    pub agreed_tos: Option<String>,
    /// Set once the challenge files from the previous response are in place
    pub challenges_installed: bool,
}

impl IssueRequest {
    pub fn for_site(site: &Site) -> Self {
        Self {
            site: site.name().to_string(),
            domains: site.domains().to_vec(),
            contact_email: site.contact_email().to_string(),
            certificate_file: site.certificate_file(),
            private_key_file: site.private_key_file(),
            state_dir: site.dir().to_path_buf(),
            agreed_tos: None,
            challenges_installed: false,
        }
    }
}

/// One answer from the issuance backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendResponse {
    /// New certificate material was written
    Issued,
    /// The existing certificate is still good; nothing was written
    AlreadyValid,
    /// Agree to the terms of service at this URL and ask again
    NeedAgreement(String),
    /// Install these files and ask again
    NeedChallengeFiles(Vec<ChallengeFile>),
    /// Rate limited; do not retry before this time
    RateLimited(DateTime<Utc>),
    /// Anything else
    Failed(String),
}

/// Issuance tool or library the issuer drives
#[async_trait]
pub trait CertBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    async fn issue(&self, request: &IssueRequest) -> BackendResponse;
}

/// Result of one site's issuance in a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueOutcome {
    /// New certificate material is on disk
    Renewed,
    /// No renewal was necessary
    NotDue,
    /// Try again next pass
    Deferred,
}

/// Drives a [`CertBackend`] for individual sites
pub struct CertificateIssuer {
    backend: Arc<dyn CertBackend>,
    challenge_dir: PathBuf,
    renew_before_days: u32,
}

impl CertificateIssuer {
    pub fn new(backend: Arc<dyn CertBackend>, document_root: impl AsRef<Path>) -> Self {
        Self {
            backend,
            challenge_dir: document_root.as_ref().join(CHALLENGE_PATH),
            renew_before_days: DEFAULT_RENEW_BEFORE_DAYS,
        }
    }

    pub fn with_renew_before_days(mut self, days: u32) -> Self {
        self.renew_before_days = days;
        self
    }

    pub fn challenge_dir(&self) -> &Path {
        &self.challenge_dir
    }

    /// Obtain or renew the certificate of `site` if it needs it.
    ///
    /// Never fails: generation errors and backend failures are logged and
    /// reported as [`IssueOutcome::Deferred`].
    pub async fn issue(&self, site: &Site) -> IssueOutcome {
        if !certificate::inspect(site, self.renew_before_days).needs_renewal() {
            return IssueOutcome::NotDue;
        }

        info!(site = %site, backend = self.backend.name(), "Generating new certificate");
        match self.attempt(site).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(site = %site, error = %e, "Certificate generation failed");
                IssueOutcome::Deferred
            }
        }
    }

    /// Run one full exchange with the backend, skipping the expiry check
    pub async fn attempt(&self, site: &Site) -> Result<IssueOutcome, CertGenerationError> {
        let mut request = IssueRequest::for_site(site);
        let mut installed = Vec::new();
        let result = self.exchange(&mut request, &mut installed).await;
        for path in installed {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(path = %path.display(), error = %e, "Couldn't remove challenge file");
            }
        }
        result
    }

    async fn exchange(
        &self,
        request: &mut IssueRequest,
        installed: &mut Vec<PathBuf>,
    ) -> Result<IssueOutcome, CertGenerationError> {
        let mut need_action_rounds = 0;

        loop {
            match self.backend.issue(request).await {
                BackendResponse::Issued => {
                    info!(site = %request.site, "New certificate generated");
                    return Ok(IssueOutcome::Renewed);
                }
                BackendResponse::AlreadyValid => {
                    info!(site = %request.site, "Backend reports certificate is still valid");
                    return Ok(IssueOutcome::NotDue);
                }
                BackendResponse::RateLimited(until) => {
                    warn!(site = %request.site, until = %until, "Rate limited, try again after");
                    return Ok(IssueOutcome::Deferred);
                }
                BackendResponse::Failed(reason) => {
                    return Err(CertGenerationError::Backend {
                        site: request.site.clone(),
                        reason,
                    });
                }
                BackendResponse::NeedAgreement(url) => {
                    if request.agreed_tos.is_some() {
                        return Err(CertGenerationError::RepeatedAgreement {
                            site: request.site.clone(),
                            url,
                        });
                    }
                    need_action_rounds = Self::count_action_round(&request.site, need_action_rounds)?;
                    info!(site = %request.site, url = %url, "Agreeing to terms of service");
                    request.agreed_tos = Some(url);
                }
                BackendResponse::NeedChallengeFiles(files) => {
                    need_action_rounds = Self::count_action_round(&request.site, need_action_rounds)?;
                    for file in &files {
                        installed.push(self.install_challenge(&request.site, file)?);
                    }
                    request.challenges_installed = true;
                }
            }
        }
    }

    fn count_action_round(site: &str, rounds: u32) -> Result<u32, CertGenerationError> {
        if rounds >= MAX_ACTION_ROUNDS {
            return Err(CertGenerationError::TooManyActionRounds {
                site: site.to_string(),
                rounds,
            });
        }
        Ok(rounds + 1)
    }

    fn install_challenge(&self, site: &str, file: &ChallengeFile) -> Result<PathBuf, CertGenerationError> {
        let safe = !file.name.is_empty()
            && !file.name.starts_with('.')
            && !file.name.contains(['/', '\\'])
            && !file.name.contains("..");
        if !safe {
            return Err(CertGenerationError::InvalidChallengeFile {
                site: site.to_string(),
                name: file.name.clone(),
            });
        }

        let path = self.challenge_dir.join(&file.name);
        debug!(site, path = %path.display(), "Writing challenge file");
        std::fs::create_dir_all(&self.challenge_dir)
            .and_then(|_| write_atomic(&path, file.content.as_bytes(), 0o644))
            .map_err(|source| CertGenerationError::ChallengeWrite {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}
