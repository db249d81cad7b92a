//! Site descriptors
//!
//! Every site lives in its own directory below the site directory. The
//! directory name is the site name, the directory holds the descriptor
//! (`conf`, JSON, or `conf.toml`) and the site's certificate material.

use crate::error::{ConfigError, ValidationError};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Descriptor file name (JSON)
pub const DESCRIPTOR_FILE: &str = "conf";
/// Alternative descriptor file name (TOML), used when `conf` is absent
pub const DESCRIPTOR_FILE_TOML: &str = "conf.toml";
/// Full chain certificate file inside a site directory
pub const CERTIFICATE_FILE: &str = "fullchain.pem";
/// Private key file inside a site directory
pub const PRIVATE_KEY_FILE: &str = "key.pem";

/// One validated virtual host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    name: String,
    dir: PathBuf,
    domains: Vec<String>,
    target: String,
    contact_email: String,
    renewal_enabled: bool,
}

impl Site {
    /// Read and validate the descriptor in `dir`
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let dir = absolute(dir.as_ref());
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ValidationError::InvalidName { path: dir.clone() })?
            .to_string();

        debug!(site = %name, "Reading site descriptor");
        let document = read_descriptor(&name, &dir)?;
        Self::from_document(name, dir, &document)
    }

    fn from_document(name: String, dir: PathBuf, document: &Value) -> Result<Self, ValidationError> {
        let map = document.as_object().ok_or_else(|| ValidationError::Malformed {
            site: name.clone(),
            reason: "top level must be a table of keys".to_string(),
        })?;

        let contact_email = required_str(&name, map, "email")?;
        let target = required_str(&name, map, "target")?;

        let domains = match map.get("domains") {
            None => {
                return Err(ValidationError::MissingKey {
                    site: name,
                    key: "domains",
                })
            }
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(ValidationError::WrongType {
                    site: name,
                    key: "domains",
                    expected: "a list of strings",
                })
            }
        };
        if domains.is_empty() {
            return Err(ValidationError::EmptyDomains { site: name });
        }
        let domains = domains
            .iter()
            .map(|d| match d.as_str() {
                Some(s) if !s.is_empty() && !s.chars().any(char::is_whitespace) => Ok(s.to_string()),
                Some(s) => Err(ValidationError::InvalidDomain {
                    site: name.clone(),
                    domain: s.to_string(),
                }),
                None => Err(ValidationError::WrongType {
                    site: name.clone(),
                    key: "domains",
                    expected: "a list of strings",
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let renewal_enabled = match map.get("letsencrypt").or_else(|| map.get("renewal_enabled")) {
            None => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Err(ValidationError::WrongType {
                    site: name,
                    key: "letsencrypt",
                    expected: "a boolean",
                })
            }
        };

        Ok(Self {
            name,
            dir,
            domains,
            target,
            contact_email,
            renewal_enabled,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Absolute path of the site's directory (descriptor and certificate storage)
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// Upstream address requests are forwarded to
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn contact_email(&self) -> &str {
        &self.contact_email
    }

    pub fn renewal_enabled(&self) -> bool {
        self.renewal_enabled
    }

    pub fn certificate_file(&self) -> PathBuf {
        self.dir.join(CERTIFICATE_FILE)
    }

    pub fn private_key_file(&self) -> PathBuf {
        self.dir.join(PRIVATE_KEY_FILE)
    }

    /// True when both the key and the full chain exist right now
    pub fn has_certificate(&self) -> bool {
        self.certificate_file().is_file() && self.private_key_file().is_file()
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn read_descriptor(site: &str, dir: &Path) -> Result<Value, ValidationError> {
    let json_path = dir.join(DESCRIPTOR_FILE);
    let toml_path = dir.join(DESCRIPTOR_FILE_TOML);

    if !json_path.exists() && toml_path.exists() {
        let data = std::fs::read_to_string(&toml_path).map_err(|source| ValidationError::Unreadable {
            site: site.to_string(),
            path: toml_path.clone(),
            source,
        })?;
        let table: toml::Value = toml::from_str(&data).map_err(|e| ValidationError::Malformed {
            site: site.to_string(),
            reason: e.to_string(),
        })?;
        return serde_json::to_value(table).map_err(|e| ValidationError::Malformed {
            site: site.to_string(),
            reason: e.to_string(),
        });
    }

    let data = std::fs::read_to_string(&json_path).map_err(|source| ValidationError::Unreadable {
        site: site.to_string(),
        path: json_path,
        source,
    })?;
    serde_json::from_str(&data).map_err(|e| ValidationError::Malformed {
        site: site.to_string(),
        reason: e.to_string(),
    })
}

fn required_str(site: &str, map: &Map<String, Value>, key: &'static str) -> Result<String, ValidationError> {
    match map.get(key) {
        None => Err(ValidationError::MissingKey {
            site: site.to_string(),
            key,
        }),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ValidationError::WrongType {
            site: site.to_string(),
            key,
            expected: "a string",
        }),
    }
}

/// Load every site below `site_dir`.
///
/// Only a failure to list the directory itself is an error; invalid sites are
/// logged and left out. The result is ordered by site name.
pub fn load_sites(site_dir: impl AsRef<Path>) -> Result<Vec<Site>, ConfigError> {
    let site_dir = site_dir.as_ref();
    info!(path = %site_dir.display(), "Reading all sites");

    let entries = std::fs::read_dir(site_dir).map_err(|source| ConfigError::SiteDirectory {
        path: site_dir.to_path_buf(),
        source,
    })?;

    let mut sites = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ConfigError::SiteDirectory {
            path: site_dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            debug!(path = %path.display(), "Skipping hidden directory");
            continue;
        }
        match Site::load(&path) {
            Ok(site) => sites.push(site),
            Err(e) => error!(path = %path.display(), error = %e, "Skipping invalid site"),
        }
    }

    sites.sort_by(|a, b| a.name.cmp(&b.name));
    info!(count = sites.len(), "Sites loaded");
    Ok(sites)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn write_site(root: &Path, name: &str, descriptor: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(DESCRIPTOR_FILE), descriptor).unwrap();
        dir
    }

    #[test]
    fn test_load_valid_site() {
        let tmp = TempDir::new().unwrap();
        let dir = write_site(
            tmp.path(),
            "blog",
            r#"{"email": "ops@example.com", "target": "http://10.0.0.2:8080",
                "domains": ["example.com", "www.example.com"], "letsencrypt": true}"#,
        );

        let site = Site::load(&dir).unwrap();
        assert_eq!(site.name(), "blog");
        assert_eq!(site.domains(), ["example.com", "www.example.com"]);
        assert_eq!(site.target(), "http://10.0.0.2:8080");
        assert_eq!(site.contact_email(), "ops@example.com");
        assert!(site.renewal_enabled());
        assert!(site.dir().is_absolute());
        assert!(!site.has_certificate());
    }

    #[test]
    fn test_renewal_defaults_to_disabled() {
        let tmp = TempDir::new().unwrap();
        let dir = write_site(
            tmp.path(),
            "plain",
            r#"{"email": "a@b.c", "target": "http://app:80", "domains": ["plain.example"]}"#,
        );
        assert!(!Site::load(&dir).unwrap().renewal_enabled());
    }

    #[test]
    fn test_renewal_enabled_alias() {
        let tmp = TempDir::new().unwrap();
        let dir = write_site(
            tmp.path(),
            "alias",
            r#"{"email": "a@b.c", "target": "http://app:80", "domains": ["a.example"], "renewal_enabled": true}"#,
        );
        assert!(Site::load(&dir).unwrap().renewal_enabled());
    }

    #[test]
    fn test_toml_descriptor() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("docs");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(DESCRIPTOR_FILE_TOML),
            "email = \"a@b.c\"\ntarget = \"http://docs:3000\"\ndomains = [\"docs.example\"]\nletsencrypt = true\n",
        )
        .unwrap();

        let site = Site::load(&dir).unwrap();
        assert_eq!(site.domains(), ["docs.example"]);
        assert!(site.renewal_enabled());
    }

    #[test]
    fn test_missing_keys() {
        let tmp = TempDir::new().unwrap();
        let dir = write_site(tmp.path(), "nomail", r#"{"target": "x", "domains": ["a"]}"#);
        assert!(matches!(
            Site::load(&dir),
            Err(ValidationError::MissingKey { key: "email", .. })
        ));

        let dir = write_site(tmp.path(), "nodomains", r#"{"email": "a@b.c", "target": "x"}"#);
        assert!(matches!(
            Site::load(&dir),
            Err(ValidationError::MissingKey { key: "domains", .. })
        ));
    }

    #[test]
    fn test_domains_must_be_non_empty_list_of_strings() {
        let tmp = TempDir::new().unwrap();
        let dir = write_site(tmp.path(), "empty", r#"{"email": "a@b.c", "target": "x", "domains": []}"#);
        assert!(matches!(Site::load(&dir), Err(ValidationError::EmptyDomains { .. })));

        let dir = write_site(tmp.path(), "scalar", r#"{"email": "a@b.c", "target": "x", "domains": "a.example"}"#);
        assert!(matches!(Site::load(&dir), Err(ValidationError::WrongType { key: "domains", .. })));

        let dir = write_site(tmp.path(), "numbers", r#"{"email": "a@b.c", "target": "x", "domains": [1, 2]}"#);
        assert!(matches!(Site::load(&dir), Err(ValidationError::WrongType { key: "domains", .. })));

        let dir = write_site(tmp.path(), "spaces", r#"{"email": "a@b.c", "target": "x", "domains": ["a b"]}"#);
        assert!(matches!(Site::load(&dir), Err(ValidationError::InvalidDomain { .. })));
    }

    #[test]
    fn test_unreadable_and_malformed() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("bare");
        std::fs::create_dir_all(&dir).unwrap();
        assert!(matches!(Site::load(&dir), Err(ValidationError::Unreadable { .. })));

        let dir = write_site(tmp.path(), "broken", "{not json");
        assert!(matches!(Site::load(&dir), Err(ValidationError::Malformed { .. })));

        let dir = write_site(tmp.path(), "list", "[1, 2, 3]");
        assert!(matches!(Site::load(&dir), Err(ValidationError::Malformed { .. })));
    }

    #[test]
    fn test_has_certificate_requires_both_files() {
        let tmp = TempDir::new().unwrap();
        let dir = write_site(tmp.path(), "tls", r#"{"email": "a@b.c", "target": "x", "domains": ["a"]}"#);
        let site = Site::load(&dir).unwrap();

        std::fs::write(dir.join(CERTIFICATE_FILE), "cert").unwrap();
        assert!(!site.has_certificate());
        std::fs::write(dir.join(PRIVATE_KEY_FILE), "key").unwrap();
        assert!(site.has_certificate());
    }

    #[test]
    fn test_load_sites_skips_invalid_and_hidden() {
        let tmp = TempDir::new().unwrap();
        write_site(tmp.path(), "b-site", r#"{"email": "a@b.c", "target": "x", "domains": ["b"]}"#);
        write_site(tmp.path(), "a-site", r#"{"email": "a@b.c", "target": "x", "domains": ["a"]}"#);
        write_site(tmp.path(), "broken", r#"{"email": "a@b.c", "target": "x", "domains": []}"#);
        write_site(tmp.path(), ".git", r#"{"email": "a@b.c", "target": "x", "domains": ["g"]}"#);
        std::fs::write(tmp.path().join("README"), "not a site").unwrap();

        let sites = load_sites(tmp.path()).unwrap();
        let names: Vec<_> = sites.iter().map(Site::name).collect();
        assert_eq!(names, ["a-site", "b-site"]);
    }

    #[test]
    fn test_load_sites_missing_directory_is_fatal() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            load_sites(tmp.path().join("nope")),
            Err(ConfigError::SiteDirectory { .. })
        ));
    }
}
