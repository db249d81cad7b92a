//! Issuance through an external ACME client such as `simp_le`
//!
//! The client runs in the site directory and handles accounts and webroot
//! challenges itself. Its exit code carries the result: 0 means a new
//! certificate was written, 1 means nothing needed to change, anything else
//! is an error.

use crate::issuer::{BackendResponse, CertBackend, IssueRequest};
use async_trait::async_trait;
use instant_acme::LetsEncrypt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// External client invoked once per site
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    document_root: PathBuf,
    testing: bool,
}

impl CommandBackend {
    /// `command` is split with shell quoting rules; the first word is the program
    pub fn new(command: &str, document_root: impl Into<PathBuf>, testing: bool) -> Result<Self, String> {
        let mut words = shell_words::split(command).map_err(|e| e.to_string())?;
        if words.is_empty() {
            return Err("command is empty".to_string());
        }
        let program = words.remove(0);
        Ok(Self {
            program,
            args: words,
            document_root: document_root.into(),
            testing,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn command_line(&self, request: &IssueRequest) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("--default_root".to_string());
        args.push(self.document_root.display().to_string());
        for file in ["account_key.json", "fullchain.pem", "key.pem"] {
            args.push("-f".to_string());
            args.push(file.to_string());
        }
        if self.testing {
            args.push("--server".to_string());
            args.push(LetsEncrypt::Staging.url().to_string());
        }
        args.push("--email".to_string());
        args.push(request.contact_email.clone());
        for domain in &request.domains {
            args.push("-d".to_string());
            args.push(domain.clone());
        }
        args
    }
}

#[async_trait]
impl CertBackend for CommandBackend {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn issue(&self, request: &IssueRequest) -> BackendResponse {
        if self.testing {
            warn!(site = %request.site, "Using ACME staging directory!");
        }
        let args = self.command_line(request);
        debug!(site = %request.site, program = %self.program, ?args, "Calling external ACME client");

        let status = Command::new(&self.program)
            .args(&args)
            .current_dir(&request.state_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;

        match status {
            Ok(status) => {
                debug!(site = %request.site, code = ?status.code(), "External ACME client exited");
                match status.code() {
                    Some(0) => BackendResponse::Issued,
                    Some(1) => BackendResponse::AlreadyValid,
                    Some(code) => BackendResponse::Failed(format!("{} exited with code {}", self.program, code)),
                    None => BackendResponse::Failed(format!("{} was terminated by a signal", self.program)),
                }
            }
            Err(e) => BackendResponse::Failed(format!("couldn't run {}: {}", self.program, e)),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(state_dir: &std::path::Path) -> IssueRequest {
        IssueRequest {
            site: "blog".to_string(),
            domains: vec!["blog.example".to_string(), "www.blog.example".to_string()],
            contact_email: "ops@example.com".to_string(),
            certificate_file: state_dir.join("fullchain.pem"),
            private_key_file: state_dir.join("key.pem"),
            state_dir: state_dir.to_path_buf(),
            agreed_tos: None,
            challenges_installed: false,
        }
    }

    #[tokio::test]
    async fn test_exit_codes() {
        let tmp = TempDir::new().unwrap();
        let cases = [
            ("sh -c 'exit 0' acme", BackendResponse::Issued),
            ("sh -c 'exit 1' acme", BackendResponse::AlreadyValid),
        ];
        for (command, expected) in cases {
            let backend = CommandBackend::new(command, "/srv/webroot", false).unwrap();
            assert_eq!(backend.issue(&request(tmp.path())).await, expected);
        }

        let backend = CommandBackend::new("sh -c 'exit 3' acme", "/srv/webroot", false).unwrap();
        assert!(matches!(
            backend.issue(&request(tmp.path())).await,
            BackendResponse::Failed(reason) if reason.contains("code 3")
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_failure() {
        let tmp = TempDir::new().unwrap();
        let backend = CommandBackend::new("/nonexistent/simp_le", "/srv/webroot", false).unwrap();
        assert!(matches!(
            backend.issue(&request(tmp.path())).await,
            BackendResponse::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_arguments_and_working_directory() {
        let tmp = TempDir::new().unwrap();
        let backend = CommandBackend::new(
            r#"sh -c 'printf "%s\n" "$@" > args.txt; exit 1' acme"#,
            "/srv/webroot",
            true,
        )
        .unwrap();

        assert_eq!(backend.issue(&request(tmp.path())).await, BackendResponse::AlreadyValid);

        let args = std::fs::read_to_string(tmp.path().join("args.txt")).unwrap();
        let args: Vec<&str> = args.lines().collect();
        assert_eq!(
            args,
            [
                "--default_root",
                "/srv/webroot",
                "-f",
                "account_key.json",
                "-f",
                "fullchain.pem",
                "-f",
                "key.pem",
                "--server",
                LetsEncrypt::Staging.url(),
                "--email",
                "ops@example.com",
                "-d",
                "blog.example",
                "-d",
                "www.blog.example",
            ]
        );
    }

    #[test]
    fn test_empty_command_is_rejected() {
        assert!(CommandBackend::new("", "/srv", false).is_err());
        assert!(CommandBackend::new("simp_le 'unterminated", "/srv", false).is_err());
    }
}
