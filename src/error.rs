//! Error types shared across the renewal and supervision engine

use std::path::PathBuf;
use thiserror::Error;

/// A site descriptor that cannot be turned into a [`Site`](crate::site::Site)
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("couldn't read descriptor of site '{site}' at {}: {source}", path.display())]
    Unreadable {
        site: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("descriptor of site '{site}' is not well-formed: {reason}")]
    Malformed { site: String, reason: String },

    #[error("missing config parameter '{key}' in site '{site}'")]
    MissingKey { site: String, key: &'static str },

    #[error("config parameter '{key}' of site '{site}' must be {expected}")]
    WrongType {
        site: String,
        key: &'static str,
        expected: &'static str,
    },

    #[error("domains of site '{site}' must not be empty")]
    EmptyDomains { site: String },

    #[error("site '{site}' has an invalid domain {domain:?}")]
    InvalidDomain { site: String, domain: String },

    #[error("site directory {} has no usable name", path.display())]
    InvalidName { path: PathBuf },
}

/// Failure turning a template into configuration text
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("template {template} references unknown placeholder '{name}'")]
    UnknownPlaceholder { template: String, name: String },

    #[error("template {template} has an unterminated placeholder at byte {offset}")]
    Unterminated { template: String, offset: usize },
}

/// Failure materializing one site's rendered configuration
#[derive(Debug, Error)]
pub enum ConfigWriteError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("couldn't write config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Unrecoverable issuance failure for one site within one pass
#[derive(Debug, Error)]
pub enum CertGenerationError {
    #[error("issuance for '{site}' still needs action after {rounds} challenge rounds")]
    TooManyActionRounds { site: String, rounds: u32 },

    #[error("issuance backend asked '{site}' to agree to terms of service again ({url})")]
    RepeatedAgreement { site: String, url: String },

    #[error("refusing challenge file name {name:?} for '{site}'")]
    InvalidChallengeFile { site: String, name: String },

    #[error("couldn't write challenge file {}: {source}", path.display())]
    ChallengeWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("issuance backend failed for '{site}': {reason}")]
    Backend { site: String, reason: String },
}

/// Failure controlling the served process
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn served process '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal served process (pid {pid}): {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Startup-time configuration problems; these terminate the process
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{what} {} must be a directory", path.display())]
    NotADirectory { what: &'static str, path: PathBuf },

    #[error("couldn't read template {}: {source}", path.display())]
    Template {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("couldn't read site directory {}: {source}", path.display())]
    SiteDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid proxy command {command:?}: {reason}")]
    ProxyCommand { command: String, reason: String },

    #[error("invalid ACME client command {command:?}: {reason}")]
    AcmeCommand { command: String, reason: String },

    #[error("couldn't create challenge directory {}: {source}", path.display())]
    ChallengeDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_messages_name_the_site() {
        let err = ValidationError::MissingKey {
            site: "blog".to_string(),
            key: "email",
        };
        assert_eq!(err.to_string(), "missing config parameter 'email' in site 'blog'");

        let err = ValidationError::EmptyDomains {
            site: "shop".to_string(),
        };
        assert!(err.to_string().contains("shop"));
    }

    #[test]
    fn test_render_error_converts_into_write_error() {
        let render = RenderError::UnknownPlaceholder {
            template: "http.conf.tmpl".to_string(),
            name: "servernames".to_string(),
        };
        let err: ConfigWriteError = render.clone().into();
        assert_eq!(err.to_string(), render.to_string());
    }
}
