//! Browser login helper.
//!
//! The headless-browser login flow runs out of process. The helper is
//! started with the seller's credentials in its environment and must print
//! the captured cookies as a JSON array (`[{"name": .., "value": ..}, ..]`)
//! on stdout, exiting 0 on success.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::CredentialRefresher;
use crate::config::SessionConfig;
use crate::types::{BrowserCookie, Credentials, DemperError};

pub const ENV_STORE_ID: &str = "DEMPER_STORE_ID";
pub const ENV_EMAIL: &str = "DEMPER_LOGIN_EMAIL";
pub const ENV_PASSWORD: &str = "DEMPER_LOGIN_PASSWORD";

/// Runs the configured login helper command.
pub struct CommandRefresher {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandRefresher {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// `None` when no helper is configured.
    pub fn from_config(cfg: &SessionConfig) -> Option<Self> {
        let (program, args) = cfg.refresh_command.split_first()?;
        Some(Self::new(
            program.clone(),
            args.to_vec(),
            Duration::from_secs(cfg.refresh_timeout_secs),
        ))
    }
}

#[async_trait]
impl CredentialRefresher for CommandRefresher {
    async fn refresh_session(
        &self,
        store_id: i64,
        credentials: &Credentials,
    ) -> Result<Vec<BrowserCookie>, DemperError> {
        debug!(store_id, program = %self.program, "Starting login helper");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(ENV_STORE_ID, store_id.to_string())
            .env(ENV_EMAIL, &credentials.email)
            .env(ENV_PASSWORD, credentials.password.expose_secret())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| DemperError::Auth(format!("login helper timed out after {:?}", self.timeout)))?
            .map_err(|e| DemperError::Config(format!("cannot start login helper {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(store_id, status = %output.status, "Login helper failed");
            return Err(DemperError::Auth(format!(
                "login helper exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let cookies: Vec<BrowserCookie> = serde_json::from_slice(&output.stdout)
            .map_err(|e| DemperError::Auth(format!("login helper printed invalid cookies: {e}")))?;
        if cookies.is_empty() {
            return Err(DemperError::Auth("login helper returned no cookies".into()));
        }
        Ok(cookies)
    }
}

/// Used when no login helper is configured; every refresh fails.
pub struct UnconfiguredRefresher;

#[async_trait]
impl CredentialRefresher for UnconfiguredRefresher {
    async fn refresh_session(&self, store_id: i64, _: &Credentials) -> Result<Vec<BrowserCookie>, DemperError> {
        Err(DemperError::Config(format!(
            "store {store_id} needs a fresh login but session.refresh_command is not set"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn creds() -> Credentials {
        Credentials {
            email: "seller@example.com".into(),
            password: SecretString::new("hunter2".into()),
        }
    }

    fn sh(script: &str, timeout: Duration) -> CommandRefresher {
        CommandRefresher::new("sh", vec!["-c".into(), script.into()], timeout)
    }

    #[tokio::test]
    async fn test_helper_cookies_parsed() {
        let refresher = sh(
            r#"printf '[{"name":"mc-sid","value":"%s","domain":".kaspi.kz"}]' "$DEMPER_LOGIN_EMAIL""#,
            Duration::from_secs(5),
        );
        let cookies = refresher.refresh_session(3, &creds()).await.unwrap();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].value, "seller@example.com");
    }

    #[tokio::test]
    async fn test_helper_nonzero_exit_is_auth_error() {
        let refresher = sh("echo 'bad password' >&2; exit 3", Duration::from_secs(5));
        let err = refresher.refresh_session(3, &creds()).await.unwrap_err();
        assert_eq!(err.kind(), "auth");
        assert!(err.to_string().contains("bad password"));
    }

    #[tokio::test]
    async fn test_helper_timeout() {
        let refresher = sh("sleep 5", Duration::from_millis(100));
        let err = refresher.refresh_session(3, &creds()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_helper_empty_output_rejected() {
        let refresher = sh("echo '[]'", Duration::from_secs(5));
        assert!(refresher.refresh_session(3, &creds()).await.is_err());
    }

    #[tokio::test]
    async fn test_unconfigured_refresher_fails() {
        let err = UnconfiguredRefresher.refresh_session(1, &creds()).await.unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_from_config() {
        assert!(CommandRefresher::from_config(&SessionConfig::default()).is_none());
        let cfg = SessionConfig {
            refresh_command: vec!["node".into(), "login.js".into()],
            refresh_timeout_secs: 60,
        };
        let refresher = CommandRefresher::from_config(&cfg).unwrap();
        assert_eq!(refresher.program, "node");
        assert_eq!(refresher.args, vec!["login.js".to_string()]);
    }
}
