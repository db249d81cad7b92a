//! Inspection of a site's existing certificate
//!
//! Decides whether the issuance backend needs to be contacted at all. A
//! certificate is kept only when it was issued by someone else, covers every
//! domain the site asks for, and stays valid for longer than the renewal
//! window.

use crate::site::Site;
use rustls_pemfile::certs;
use std::collections::BTreeSet;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info};
use x509_parser::prelude::*;

/// Default renewal window in days
pub const DEFAULT_RENEW_BEFORE_DAYS: u32 = 30;

const SECS_PER_DAY: i64 = 24 * 60 * 60;

/// What was found in a site's `fullchain.pem`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateStatus {
    /// No certificate file
    Missing,
    /// The file exists but holds no parsable certificate
    Unreadable(String),
    /// Issuer equals subject
    SelfSigned,
    /// Expires in fewer than the configured number of days
    Expiring { remaining_days: i64 },
    /// Valid, but not for every requested domain
    MissingDomains(Vec<String>),
    /// Nothing to do
    Valid { remaining_days: i64 },
}

impl CertificateStatus {
    pub fn needs_renewal(&self) -> bool {
        !matches!(self, Self::Valid { .. })
    }
}

/// Inspect the site's certificate against its domains.
pub fn inspect(site: &Site, renew_before_days: u32) -> CertificateStatus {
    let status = inspect_file(&site.certificate_file(), site.domains(), renew_before_days, now_timestamp());
    match &status {
        CertificateStatus::Missing => info!(site = %site, "Certificate file not present"),
        CertificateStatus::Unreadable(reason) => info!(site = %site, reason = %reason, "Certificate unreadable, replacing"),
        CertificateStatus::SelfSigned => info!(site = %site, "Replacing self-signed certificate"),
        CertificateStatus::Expiring { remaining_days } => {
            info!(site = %site, remaining_days, "Replacing expiring certificate")
        }
        CertificateStatus::MissingDomains(domains) => {
            info!(site = %site, missing = ?domains, "Certificate does not cover all domains")
        }
        CertificateStatus::Valid { remaining_days } => {
            debug!(site = %site, remaining_days, "Certificate is valid")
        }
    }
    status
}

fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) fn inspect_file(path: &Path, domains: &[String], renew_before_days: u32, now: i64) -> CertificateStatus {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CertificateStatus::Missing,
        Err(e) => return CertificateStatus::Unreadable(e.to_string()),
    };

    let leaf = match certs(&mut BufReader::new(&data[..])).next() {
        Some(Ok(der)) => der,
        Some(Err(e)) => return CertificateStatus::Unreadable(e.to_string()),
        None => return CertificateStatus::Unreadable("no certificate in file".to_string()),
    };

    let (_, parsed) = match X509Certificate::from_der(leaf.as_ref()) {
        Ok(result) => result,
        Err(e) => return CertificateStatus::Unreadable(e.to_string()),
    };

    if parsed.issuer().as_raw() == parsed.subject().as_raw() {
        return CertificateStatus::SelfSigned;
    }

    let remaining_days = (parsed.validity().not_after.timestamp() - now).div_euclid(SECS_PER_DAY);
    if remaining_days < i64::from(renew_before_days) {
        return CertificateStatus::Expiring { remaining_days };
    }

    let covered: BTreeSet<String> = match parsed.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
                _ => None,
            })
            .collect(),
        _ => BTreeSet::new(),
    };
    let missing: Vec<String> = domains
        .iter()
        .filter(|d| !covered.contains(&d.to_ascii_lowercase()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return CertificateStatus::MissingDomains(missing);
    }

    CertificateStatus::Valid { remaining_days }
}
