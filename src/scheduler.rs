//! Daily renewal pass
//!
//! The scheduler is idle until `next_run_at`; a trigger before then is a
//! no-op. A pass asks the issuer about every site with renewal enabled,
//! rewrites the config of every renewed site, and reports whether the served
//! process must reload. Whatever happened, the next pass is scheduled for
//! 02:00 on the following calendar day.

use crate::issuer::{CertificateIssuer, IssueOutcome};
use crate::site::Site;
use crate::writer::{ConfigWriter, ConfigureReport};
use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone};
use tracing::{debug, error, info};

/// Hour of day the daily pass runs at
pub const RUN_HOUR: u32 = 2;

/// What a single pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// False when the trigger arrived before `next_run_at`
    pub ran: bool,
    /// Sites with new certificate material
    pub renewed: Vec<String>,
    /// Sites that could not be renewed this time
    pub deferred: Vec<String>,
    /// Set once per pass when at least one site was renewed
    pub reload_required: bool,
}

pub struct RenewalScheduler {
    issuer: CertificateIssuer,
    writer: ConfigWriter,
    sites: Vec<Site>,
    next_run_at: DateTime<Local>,
}

impl RenewalScheduler {
    /// The first pass is due immediately
    pub fn new(issuer: CertificateIssuer, writer: ConfigWriter, sites: Vec<Site>) -> Self {
        Self {
            issuer,
            writer,
            sites,
            next_run_at: Local::now(),
        }
    }

    pub fn next_run_at(&self) -> DateTime<Local> {
        self.next_run_at
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    pub fn writer(&self) -> &ConfigWriter {
        &self.writer
    }

    /// Swap in freshly loaded sites; takes effect for the next pass
    pub fn replace_sites(&mut self, sites: Vec<Site>) {
        info!(count = sites.len(), "Site list replaced");
        self.sites = sites;
    }

    /// Regenerate every site config from scratch
    pub fn init_config(&self) -> ConfigureReport {
        self.writer.clean_and_configure_all(&self.sites)
    }

    pub async fn run_pass(&mut self) -> PassReport {
        self.run_pass_at(Local::now()).await
    }

    pub async fn run_pass_at(&mut self, now: DateTime<Local>) -> PassReport {
        if now < self.next_run_at {
            debug!(next_run_at = %self.next_run_at, "Too early for a certificate update");
            return PassReport::default();
        }

        let mut report = PassReport {
            ran: true,
            ..Default::default()
        };

        for site in self.sites.iter().filter(|s| s.renewal_enabled()) {
            info!(site = %site, "Checking certificate");
            match self.issuer.issue(site).await {
                IssueOutcome::Renewed => {
                    info!(site = %site, "Certificate has changed");
                    report.renewed.push(site.name().to_string());
                    if let Err(e) = self.writer.configure_one(site) {
                        error!(site = %site, error = %e, "Failed to update site config after renewal");
                    }
                }
                IssueOutcome::NotDue => {}
                IssueOutcome::Deferred => report.deferred.push(site.name().to_string()),
            }
        }

        report.reload_required = !report.renewed.is_empty();
        if report.reload_required {
            debug!(renewed = ?report.renewed, "Served process needs a reload");
        }

        self.next_run_at = next_run_after(&now);
        info!(next_run_at = %self.next_run_at, "Next certificate update scheduled");
        report
    }
}

/// 02:00 on the calendar day after `now`, in `now`'s time zone
pub fn next_run_after<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Tz> {
    let tomorrow = now.date_naive() + Duration::days(1);
    let at = tomorrow.and_time(NaiveTime::from_hms_opt(RUN_HOUR, 0, 0).unwrap_or_default());
    let tz = now.timezone();
    tz.from_local_datetime(&at)
        .earliest()
        // 02:00 can fall into a DST gap; the first valid hour after it is fine
        .or_else(|| tz.from_local_datetime(&(at + Duration::hours(1))).earliest())
        .unwrap_or_else(|| now.clone() + Duration::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuer::tests::ScriptedBackend;
    use crate::issuer::{BackendResponse, CHALLENGE_PATH};
    use crate::render::{Renderer, Template};
    use crate::site::tests::write_site;
    use chrono::Utc;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        sites_dir: TempDir,
        conf_dir: TempDir,
        webroot: TempDir,
        backend: Arc<ScriptedBackend>,
    }

    impl Fixture {
        fn new() -> Self {
            let webroot = TempDir::new().unwrap();
            let backend = Arc::new(ScriptedBackend::watching(&webroot.path().join(CHALLENGE_PATH)));
            Self {
                sites_dir: TempDir::new().unwrap(),
                conf_dir: TempDir::new().unwrap(),
                webroot,
                backend,
            }
        }

        fn site(&self, name: &str, renewal: bool) -> Site {
            let dir = write_site(
                self.sites_dir.path(),
                name,
                &format!(
                    r#"{{"email": "a@b.c", "target": "http://up", "domains": ["{name}.example"], "letsencrypt": {renewal}}}"#
                ),
            );
            Site::load(dir).unwrap()
        }

        fn scheduler(&self, sites: Vec<Site>) -> RenewalScheduler {
            let http = Template::parse("http", "plain {{ site_name }}").unwrap();
            let https = Template::parse("https", "tls {{ site_name }}").unwrap();
            let writer = ConfigWriter::new(self.conf_dir.path(), Renderer::new(http, https, self.webroot.path()));
            let issuer = CertificateIssuer::new(self.backend.clone(), self.webroot.path());
            RenewalScheduler::new(issuer, writer, sites)
        }

        fn conf(&self, name: &str) -> String {
            std::fs::read_to_string(self.conf_dir.path().join(format!("{name}.conf"))).unwrap()
        }
    }

    fn local(y: i32, m: u32, d: u32, h: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, 0, 0).earliest().unwrap()
    }

    #[test]
    fn test_next_run_is_two_am_next_day() {
        let now = Utc.with_ymd_and_hms(2026, 10, 15, 13, 45, 0).unwrap();
        assert_eq!(next_run_after(&now), Utc.with_ymd_and_hms(2026, 10, 16, 2, 0, 0).unwrap());

        let just_after_midnight = Utc.with_ymd_and_hms(2026, 12, 31, 0, 5, 0).unwrap();
        assert_eq!(
            next_run_after(&just_after_midnight),
            Utc.with_ymd_and_hms(2027, 1, 1, 2, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_disabled_sites_are_never_issued() {
        let fx = Fixture::new();
        let sites = vec![fx.site("manual", false), fx.site("auto", true)];
        fx.backend.script("auto", vec![BackendResponse::AlreadyValid]);
        let mut scheduler = fx.scheduler(sites);

        let report = scheduler.run_pass().await;
        assert!(report.ran);
        assert_eq!(fx.backend.called_sites(), ["auto"]);
        assert!(!report.reload_required);
    }

    #[tokio::test]
    async fn test_early_trigger_is_a_no_op() {
        let fx = Fixture::new();
        let mut scheduler = fx.scheduler(vec![fx.site("auto", true)]);
        fx.backend.script("auto", vec![BackendResponse::AlreadyValid]);

        let first = local(2026, 10, 15, 13);
        scheduler.run_pass_at(first).await;
        let scheduled = scheduler.next_run_at();
        assert_eq!(scheduled, local(2026, 10, 16, 2));
        let calls = fx.backend.calls.lock().unwrap().len();

        let report = scheduler.run_pass_at(local(2026, 10, 15, 23)).await;
        assert_eq!(report, PassReport::default());
        assert_eq!(fx.backend.calls.lock().unwrap().len(), calls);
        assert_eq!(scheduler.next_run_at(), scheduled);
    }

    #[tokio::test]
    async fn test_pass_advances_schedule_even_without_changes() {
        let fx = Fixture::new();
        let mut scheduler = fx.scheduler(vec![fx.site("manual", false)]);

        let report = scheduler.run_pass_at(local(2026, 10, 15, 13)).await;
        assert!(report.ran);
        assert!(report.renewed.is_empty());
        assert_eq!(scheduler.next_run_at(), local(2026, 10, 16, 2));
    }

    #[tokio::test]
    async fn test_deferred_site_does_not_block_others() {
        let fx = Fixture::new();
        let sites = vec![fx.site("alpha", true), fx.site("beta", true)];
        fx.backend.script("alpha", vec![BackendResponse::RateLimited(Utc::now())]);
        fx.backend.script("beta", vec![BackendResponse::AlreadyValid]);
        let mut scheduler = fx.scheduler(sites);

        let report = scheduler.run_pass().await;
        assert_eq!(fx.backend.called_sites(), ["alpha", "beta"]);
        assert_eq!(report.deferred, ["alpha"]);
        assert!(!report.reload_required);
    }

    #[tokio::test]
    async fn test_renewal_rewrites_config_and_requests_one_reload() {
        let fx = Fixture::new();
        let sites = vec![fx.site("alpha", true), fx.site("beta", true), fx.site("gamma", true)];
        fx.backend.script(
            "alpha",
            vec![
                BackendResponse::NeedChallengeFiles(vec![crate::issuer::ChallengeFile {
                    name: "tok".to_string(),
                    content: "tok.key".to_string(),
                }]),
                BackendResponse::Issued,
            ],
        );
        fx.backend.script("beta", vec![BackendResponse::Issued]);
        fx.backend.script("gamma", vec![BackendResponse::Failed("boom".to_string())]);
        let mut scheduler = fx.scheduler(sites);

        scheduler.init_config();
        assert_eq!(fx.conf("alpha"), "plain alpha");
        assert_eq!(fx.conf("beta"), "plain beta");

        let report = scheduler.run_pass().await;
        assert_eq!(report.renewed, ["alpha", "beta"]);
        assert_eq!(report.deferred, ["gamma"]);
        assert!(report.reload_required);

        assert_eq!(fx.conf("alpha"), "tls alpha");
        assert_eq!(fx.conf("beta"), "tls beta");
        assert_eq!(fx.conf("gamma"), "plain gamma");
    }

    #[tokio::test]
    async fn test_replace_sites() {
        let fx = Fixture::new();
        let mut scheduler = fx.scheduler(vec![fx.site("old", true)]);
        scheduler.replace_sites(vec![fx.site("new", false)]);

        let names: Vec<_> = scheduler.sites().iter().map(Site::name).collect();
        assert_eq!(names, ["new"]);
        scheduler.run_pass().await;
        assert!(fx.backend.calls.lock().unwrap().is_empty());
    }
}
