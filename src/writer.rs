//! Materializes rendered site configs into the served process's config directory
//!
//! Each site ends up in `<conf_dir>/<site>.conf`. Files are written to a
//! temporary file in the same directory and renamed into place, so the
//! served process never reads a half-written config and a failed write
//! leaves the previous version untouched.

use crate::error::ConfigWriteError;
use crate::render::Renderer;
use crate::site::Site;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Suffix of every file this writer owns in the config directory
pub const CONFIG_SUFFIX: &str = ".conf";

/// Outcome of a full regeneration pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigureReport {
    /// Sites whose config was written
    pub written: Vec<String>,
    /// Sites whose config could not be rendered or written
    pub failed: Vec<String>,
    /// Stale files removed before writing
    pub removed: Vec<PathBuf>,
}

/// Writes per-site configuration files
#[derive(Debug, Clone)]
pub struct ConfigWriter {
    conf_dir: PathBuf,
    renderer: Renderer,
}

impl ConfigWriter {
    pub fn new(conf_dir: impl Into<PathBuf>, renderer: Renderer) -> Self {
        Self {
            conf_dir: conf_dir.into(),
            renderer,
        }
    }

    /// Path of the generated config for `site`
    pub fn config_path(&self, site: &Site) -> PathBuf {
        self.conf_dir.join(format!("{}{}", site.name(), CONFIG_SUFFIX))
    }

    /// Remove every generated config file, then write one per site.
    ///
    /// A site that fails to render or write is logged and skipped; the
    /// remaining sites are still configured.
    pub fn clean_and_configure_all(&self, sites: &[Site]) -> ConfigureReport {
        let mut report = ConfigureReport {
            removed: self.clean(),
            ..Default::default()
        };

        for site in sites {
            match self.configure_one(site) {
                Ok(()) => report.written.push(site.name().to_string()),
                Err(e) => {
                    error!(site = %site, error = %e, "Failed to configure site");
                    report.failed.push(site.name().to_string());
                }
            }
        }

        info!(
            written = report.written.len(),
            failed = report.failed.len(),
            removed = report.removed.len(),
            "Site configs regenerated"
        );
        report
    }

    /// Re-render and rewrite a single site's config, leaving other files alone
    pub fn configure_one(&self, site: &Site) -> Result<(), ConfigWriteError> {
        let has_certificate = site.has_certificate();
        info!(site = %site, has_certificate, "Generating site config");
        let config = self.renderer.render(site, has_certificate)?;

        let path = self.config_path(site);
        debug!(site = %site, path = %path.display(), "Writing site config file");
        write_atomic(&path, config.as_bytes(), 0o644).map_err(|source| ConfigWriteError::Io { path, source })
    }

    fn clean(&self) -> Vec<PathBuf> {
        info!(path = %self.conf_dir.display(), "Removing old config files");
        let entries = match std::fs::read_dir(&self.conf_dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!(path = %self.conf_dir.display(), error = %e, "Couldn't list config directory");
                return Vec::new();
            }
        };

        let mut removed = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_generated = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(CONFIG_SUFFIX));
            if !is_generated || !path.is_file() {
                continue;
            }
            debug!(path = %path.display(), "Removing old config file");
            match std::fs::remove_file(&path) {
                Ok(()) => removed.push(path),
                Err(e) => warn!(path = %path.display(), error = %e, "Couldn't remove old config file"),
            }
        }
        removed
    }
}

/// Write `contents` to `path` through a temp file in the same directory.
///
/// `mode` is applied on unix before the rename.
pub(crate) fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::Template;
    use crate::site::tests::write_site;
    use crate::site::{CERTIFICATE_FILE, PRIVATE_KEY_FILE};
    use tempfile::TempDir;

    fn test_writer(conf_dir: &Path) -> ConfigWriter {
        let http = Template::parse("http", "http {{ site_name }} {{ domains }}\n").unwrap();
        let https = Template::parse("https", "https {{ site_name }} {{ certificate }}\n").unwrap();
        ConfigWriter::new(conf_dir, Renderer::new(http, https, "/srv/webroot"))
    }

    fn site(root: &Path, name: &str) -> Site {
        let dir = write_site(
            root,
            name,
            &format!(r#"{{"email": "a@b.c", "target": "http://up", "domains": ["{name}.example"]}}"#),
        );
        Site::load(dir).unwrap()
    }

    #[test]
    fn test_configure_one_selects_template_by_certificate() {
        let sites = TempDir::new().unwrap();
        let conf = TempDir::new().unwrap();
        let writer = test_writer(conf.path());
        let blog = site(sites.path(), "blog");

        writer.configure_one(&blog).unwrap();
        let content = std::fs::read_to_string(conf.path().join("blog.conf")).unwrap();
        assert_eq!(content, "http blog blog.example\n");

        std::fs::write(blog.dir().join(CERTIFICATE_FILE), "cert").unwrap();
        std::fs::write(blog.dir().join(PRIVATE_KEY_FILE), "key").unwrap();
        writer.configure_one(&blog).unwrap();
        let content = std::fs::read_to_string(conf.path().join("blog.conf")).unwrap();
        assert!(content.starts_with("https blog "));
        assert!(content.contains("fullchain.pem"));
    }

    #[test]
    fn test_clean_removes_only_generated_files() {
        let sites = TempDir::new().unwrap();
        let conf = TempDir::new().unwrap();
        std::fs::write(conf.path().join("gone.conf"), "stale").unwrap();
        std::fs::write(conf.path().join("mime.types"), "keep").unwrap();
        std::fs::create_dir(conf.path().join("snippets.conf")).unwrap();

        let writer = test_writer(conf.path());
        let report = writer.clean_and_configure_all(&[site(sites.path(), "live")]);

        assert_eq!(report.written, ["live"]);
        assert_eq!(report.removed, [conf.path().join("gone.conf")]);
        assert!(!conf.path().join("gone.conf").exists());
        assert!(conf.path().join("mime.types").exists());
        assert!(conf.path().join("snippets.conf").is_dir());
        assert!(conf.path().join("live.conf").exists());
    }

    #[test]
    fn test_clean_and_configure_all_is_idempotent() {
        let sites = TempDir::new().unwrap();
        let conf = TempDir::new().unwrap();
        let writer = test_writer(conf.path());
        let all = [site(sites.path(), "a"), site(sites.path(), "b")];

        writer.clean_and_configure_all(&all);
        let first_a = std::fs::read(conf.path().join("a.conf")).unwrap();
        let first_b = std::fs::read(conf.path().join("b.conf")).unwrap();

        writer.clean_and_configure_all(&all);
        assert_eq!(std::fs::read(conf.path().join("a.conf")).unwrap(), first_a);
        assert_eq!(std::fs::read(conf.path().join("b.conf")).unwrap(), first_b);

        let count = std::fs::read_dir(conf.path()).unwrap().count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_failed_write_does_not_stop_other_sites() {
        let sites = TempDir::new().unwrap();
        let conf = TempDir::new().unwrap();
        let writer = test_writer(conf.path());
        // A directory squatting on the target path makes the rename fail
        std::fs::create_dir(conf.path().join("blocked.conf")).unwrap();
        std::fs::create_dir(conf.path().join("blocked.conf").join("inner")).unwrap();

        let report = writer.clean_and_configure_all(&[site(sites.path(), "blocked"), site(sites.path(), "fine")]);
        assert_eq!(report.failed, ["blocked"]);
        assert_eq!(report.written, ["fine"]);
        assert!(conf.path().join("fine.conf").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_written_config_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let sites = TempDir::new().unwrap();
        let conf = TempDir::new().unwrap();
        let writer = test_writer(conf.path());
        writer.configure_one(&site(sites.path(), "perm")).unwrap();

        let mode = std::fs::metadata(conf.path().join("perm.conf")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
