//! Built-in ACME (Let's Encrypt) issuance backend
//!
//! Speaks the HTTP-01 flow through `instant-acme` and maps it onto the
//! issuer's exchange:
//!
//! 1. No account for the site and no agreement yet: answer
//!    [`BackendResponse::NeedAgreement`] with the directory's terms of service.
//! 2. Create or load the account, place an order and answer
//!    [`BackendResponse::NeedChallengeFiles`] with one file per pending
//!    authorization. The order is parked until the next call.
//! 3. Once the caller reports the files installed, mark the challenges ready,
//!    wait for the order, finalize it with a fresh key and write
//!    `fullchain.pem` and `key.pem`.
//!
//! Account credentials are stored per site in `account.json` (mode 0600), so
//! sites never share issuance state.

use crate::issuer::{BackendResponse, CertBackend, ChallengeFile, IssueRequest};
use crate::writer::write_atomic;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

/// Account credentials file inside a site directory
pub const ACCOUNT_FILE: &str = "account.json";

const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(2);
const ORDER_POLL_MAX_ATTEMPTS: u32 = 30;
const RATE_LIMIT_FALLBACK_HOURS: i64 = 1;

/// An order waiting for its challenge files to be published
struct PendingOrder {
    order: Order,
    challenge_urls: Vec<String>,
}

/// Issuance through an ACME directory
pub struct AcmeBackend {
    directory_url: String,
    terms_of_service: OnceCell<String>,
    pending: Mutex<HashMap<String, PendingOrder>>,
    poll_interval: Duration,
}

impl AcmeBackend {
    pub fn new(directory_url: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            terms_of_service: OnceCell::new(),
            pending: Mutex::new(HashMap::new()),
            poll_interval: ORDER_POLL_INTERVAL,
        }
    }

    /// Let's Encrypt production, or staging when `testing` is set
    pub fn lets_encrypt(testing: bool) -> Self {
        if testing {
            warn!("Using ACME staging directory!");
            Self::new(LetsEncrypt::Staging.url())
        } else {
            Self::new(LetsEncrypt::Production.url())
        }
    }

    /// Use a known terms-of-service URL instead of reading it from the directory
    pub fn with_terms_of_service(self, url: impl Into<String>) -> Self {
        let _ = self.terms_of_service.set(url.into());
        self
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    async fn terms_of_service(&self) -> anyhow::Result<String> {
        self.terms_of_service
            .get_or_try_init(|| async {
                debug!(directory = %self.directory_url, "Fetching ACME directory");
                let directory: serde_json::Value = reqwest::get(&self.directory_url).await?.json().await?;
                Ok::<_, anyhow::Error>(
                    terms_of_service_from_directory(&directory).unwrap_or_else(|| self.directory_url.clone()),
                )
            })
            .await
            .cloned()
    }

    async fn load_account(&self, state_dir: &Path) -> anyhow::Result<Option<Account>> {
        let account_path = state_dir.join(ACCOUNT_FILE);
        if !account_path.exists() {
            return Ok(None);
        }
        debug!(path = %account_path.display(), "Loading existing ACME account");
        let data = tokio::fs::read_to_string(&account_path).await?;
        let credentials: AccountCredentials = serde_json::from_str(&data)?;
        Ok(Some(Account::from_credentials(credentials).await?))
    }

    async fn create_account(&self, request: &IssueRequest) -> anyhow::Result<Account> {
        info!(site = %request.site, "Creating new ACME account");
        let contact = format!("mailto:{}", request.contact_email);
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[contact.as_str()],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;

        let account_path = request.state_dir.join(ACCOUNT_FILE);
        let data = serde_json::to_string_pretty(&credentials)?;
        write_atomic(&account_path, data.as_bytes(), 0o600)?;
        info!(path = %account_path.display(), "ACME account credentials saved");
        Ok(account)
    }

    async fn try_issue(&self, request: &IssueRequest) -> anyhow::Result<BackendResponse> {
        let parked = self.pending.lock().await.remove(&request.site);
        if let Some(pending) = parked {
            if request.challenges_installed {
                return self.complete(pending, request).await;
            }
            debug!(site = %request.site, "Discarding stale pending order");
        }

        let account = match self.load_account(&request.state_dir).await? {
            Some(account) => account,
            None => match &request.agreed_tos {
                None => return Ok(BackendResponse::NeedAgreement(self.terms_of_service().await?)),
                Some(url) => {
                    debug!(site = %request.site, tos = %url, "Terms of service agreed");
                    self.create_account(request).await?
                }
            },
        };

        let identifiers: Vec<Identifier> = request.domains.iter().map(|d| Identifier::Dns(d.clone())).collect();
        info!(site = %request.site, domains = ?request.domains, "Requesting new certificate");
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let mut files = Vec::new();
        let mut challenge_urls = Vec::new();
        for authz in order.authorizations().await? {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }
            let Identifier::Dns(domain) = &authz.identifier;
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow::anyhow!("HTTP-01 challenge not available for {}", domain))?;

            debug!(site = %request.site, domain = %domain, token = %challenge.token, "HTTP-01 challenge requested");
            files.push(ChallengeFile {
                name: challenge.token.clone(),
                content: order.key_authorization(challenge).as_str().to_string(),
            });
            challenge_urls.push(challenge.url.clone());
        }

        if files.is_empty() {
            return self.finalize(order, request).await;
        }

        self.pending
            .lock()
            .await
            .insert(request.site.clone(), PendingOrder { order, challenge_urls });
        Ok(BackendResponse::NeedChallengeFiles(files))
    }

    async fn complete(&self, pending: PendingOrder, request: &IssueRequest) -> anyhow::Result<BackendResponse> {
        let PendingOrder {
            mut order,
            challenge_urls,
        } = pending;

        for url in &challenge_urls {
            order.set_challenge_ready(url).await?;
        }

        let mut attempts = 0;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    return Ok(BackendResponse::Failed(format!(
                        "domain validation failed for {:?}",
                        request.domains
                    )))
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > ORDER_POLL_MAX_ATTEMPTS {
                        return Ok(BackendResponse::Failed("authorization timeout".to_string()));
                    }
                    debug!(site = %request.site, attempt = attempts, "Waiting for authorization");
                }
            }
        }

        self.finalize(order, request).await
    }

    async fn finalize(&self, mut order: Order, request: &IssueRequest) -> anyhow::Result<BackendResponse> {
        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

        if matches!(order.state().status, OrderStatus::Ready) {
            let mut params = CertificateParams::new(request.domains.clone())?;
            params.distinguished_name = DistinguishedName::new();
            params
                .distinguished_name
                .push(DnType::CommonName, request.domains[0].clone());
            let csr = params.serialize_request(&private_key)?;
            order.finalize(csr.der()).await?;
        }

        let mut attempts = 0;
        let cert_chain_pem = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => match order.certificate().await? {
                    Some(cert) => break cert,
                    None => anyhow::bail!("order valid but no certificate returned"),
                },
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > ORDER_POLL_MAX_ATTEMPTS {
                        anyhow::bail!("certificate timeout");
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                _ => anyhow::bail!("unexpected order status: {:?}", order.state().status),
            }
        };

        write_atomic(&request.private_key_file, private_key.serialize_pem().as_bytes(), 0o600)?;
        write_atomic(&request.certificate_file, cert_chain_pem.as_bytes(), 0o644)?;
        info!(
            site = %request.site,
            path = %request.certificate_file.display(),
            "Certificate obtained and saved"
        );
        Ok(BackendResponse::Issued)
    }
}

#[async_trait]
impl CertBackend for AcmeBackend {
    fn name(&self) -> &'static str {
        "acme"
    }

    async fn issue(&self, request: &IssueRequest) -> BackendResponse {
        match self.try_issue(request).await {
            Ok(response) => response,
            Err(e) => classify_error(&e),
        }
    }
}

fn classify_error(error: &anyhow::Error) -> BackendResponse {
    if let Some(instant_acme::Error::Api(problem)) = error.downcast_ref::<instant_acme::Error>() {
        let rate_limited = problem
            .r#type
            .as_deref()
            .is_some_and(|t| t.ends_with(":rateLimited"));
        if rate_limited {
            let detail = problem.detail.as_deref().unwrap_or_default();
            let until = parse_retry_after(detail)
                .unwrap_or_else(|| Utc::now() + ChronoDuration::hours(RATE_LIMIT_FALLBACK_HOURS));
            return BackendResponse::RateLimited(until);
        }
    }
    BackendResponse::Failed(format!("{:#}", error))
}

fn terms_of_service_from_directory(directory: &serde_json::Value) -> Option<String> {
    directory
        .get("meta")?
        .get("termsOfService")?
        .as_str()
        .map(str::to_string)
}

/// Extract the time from a "retry after 2026-10-15 20:12:36 UTC" problem detail
fn parse_retry_after(detail: &str) -> Option<DateTime<Utc>> {
    const MARKER: &str = "retry after ";
    let start = detail.find(MARKER)? + MARKER.len();
    let stamp = detail.get(start..start + 19)?;
    NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
