//! Single-flight wrapper around the external vault CLI (`bw`).
//!
//! At most one invocation is in flight process-wide: every call goes
//! through the shared `cli_mutex`, independent of which caller initiated
//! it, because the CLI itself assumes a single on-disk session.

mod sanitize;

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::store::models::LogLine;

pub use sanitize::{redact_args, sanitize_output};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultStatus {
    Unauthenticated,
    Locked,
    Unlocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    EncryptedJson,
}

impl ExportFormat {
    fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::EncryptedJson => "encrypted_json",
        }
    }
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
}

/// One vault session's worth of CLI calls, sharing a process-global mutex
/// with every other live `Driver`.
pub struct Driver {
    bw_binary: String,
    cli_mutex: Arc<Mutex<()>>,
    deadline: Instant,
    trace: std::sync::Mutex<Vec<LogLine>>,
}

impl Driver {
    pub fn new(bw_binary: impl Into<String>, cli_mutex: Arc<Mutex<()>>, deadline: Duration) -> Self {
        Self {
            bw_binary: bw_binary.into(),
            cli_mutex,
            deadline: Instant::now() + deadline,
            trace: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn trace(&self) -> Vec<LogLine> {
        self.trace.lock().unwrap().clone()
    }

    pub async fn status(&self) -> Result<VaultStatus> {
        let out = self.run(&["status"], &[], None).await?;
        let parsed: StatusResponse = serde_json::from_str(out.stdout.trim())
            .map_err(|e| Error::Other(anyhow::anyhow!("parsing bw status output: {e}")))?;
        match parsed.status.as_str() {
            "unauthenticated" => Ok(VaultStatus::Unauthenticated),
            "locked" => Ok(VaultStatus::Locked),
            "unlocked" => Ok(VaultStatus::Unlocked),
            other => Err(Error::Other(anyhow::anyhow!("unknown bw status {other}"))),
        }
    }

    pub async fn config_server(&self, url: &str) -> Result<()> {
        self.run(&["config", "server", url], &[], None).await?;
        Ok(())
    }

    pub async fn login(&self, client_id: &str, client_secret: &str) -> Result<()> {
        let env = [
            ("BW_CLIENTID".to_string(), client_id.to_string()),
            ("BW_CLIENTSECRET".to_string(), client_secret.to_string()),
        ];
        self.run(&["login", "--apikey"], &env, None).await?;
        Ok(())
    }

    pub async fn sync(&self) -> Result<()> {
        self.run(&["sync"], &[], None).await?;
        Ok(())
    }

    /// Returns the session token, or `None` if `bw` produced no token but a
    /// follow-up `status` call reports `unlocked` anyway.
    pub async fn unlock(&self, master_password: &str) -> Result<Option<String>> {
        if self.status().await? == VaultStatus::Unauthenticated {
            return Err(Error::NotLoggedIn);
        }
        let env = [("BW_PASSWORD".to_string(), master_password.to_string())];
        let out = self
            .run(
                &["unlock", "--raw", "--passwordenv", "BW_PASSWORD", "--nointeraction"],
                &env,
                None,
            )
            .await;

        let out = match out {
            Ok(out) => out,
            Err(Error::CliExit { stderr_tail, .. }) if stderr_tail.to_lowercase().contains("not logged in") => {
                return Err(Error::NotLoggedIn);
            }
            Err(e) => return Err(e),
        };

        let token = out.stdout.trim().to_string();
        if !token.is_empty() {
            return Ok(Some(token));
        }
        if self.status().await? == VaultStatus::Unlocked {
            return Ok(None);
        }
        Err(Error::Other(anyhow::anyhow!("unlock produced no session token")))
    }

    pub async fn export(
        &self,
        output_path: &str,
        format: ExportFormat,
        password: Option<&str>,
        session: Option<&str>,
    ) -> Result<()> {
        let mut args = vec![
            "export".to_string(),
            "--output".to_string(),
            output_path.to_string(),
            "--format".to_string(),
            format.as_str().to_string(),
        ];
        if let Some(pw) = password {
            args.push("--password".to_string());
            args.push(pw.to_string());
        }
        if let Some(tok) = session {
            args.push("--session".to_string());
            args.push(tok.to_string());
        }
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.run(&arg_refs, &[], None).await?;
        Ok(())
    }

    pub async fn import(&self, path: &str, format: &str, session: Option<&str>) -> Result<()> {
        let mut args = vec!["import".to_string(), format.to_string(), path.to_string()];
        if let Some(tok) = session {
            args.push("--session".to_string());
            args.push(tok.to_string());
        }
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.run(&arg_refs, &[], None).await?;
        Ok(())
    }

    /// Idempotent: "You are not logged in" on stderr is treated as success.
    pub async fn logout(&self) -> Result<()> {
        match self.run(&["logout"], &[], None).await {
            Ok(_) => Ok(()),
            Err(Error::CliExit { stderr_tail, .. }) if stderr_tail.contains("You are not logged in") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn run(&self, args: &[&str], extra_env: &[(String, String)], stdin: Option<&str>) -> Result<RawOutput> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Other(anyhow::anyhow!("pipeline deadline exceeded")));
        }

        let _permit = self.cli_mutex.lock().await;

        let mut cmd = Command::new(&self.bw_binary);
        cmd.args(args)
            .envs(extra_env.iter().map(|(k, v)| (k.clone(), v.clone())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let start = Instant::now();
        let owned_args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let redacted = redact_args(&owned_args).join(" ");

        let result = tokio::time::timeout(remaining, async {
            let mut child = cmd.spawn().map_err(|e| Error::Other(anyhow::anyhow!("spawning bw: {e}")))?;
            if let Some(input) = stdin {
                use tokio::io::AsyncWriteExt;
                if let Some(mut si) = child.stdin.take() {
                    si.write_all(input.as_bytes())
                        .await
                        .map_err(|e| Error::Other(anyhow::anyhow!("writing bw stdin: {e}")))?;
                }
            }
            let output = child
                .wait_with_output()
                .await
                .map_err(|e| Error::Other(anyhow::anyhow!("waiting for bw: {e}")))?;
            Ok::<_, Error>(output)
        })
        .await;

        let output = match result {
            Ok(inner) => inner?,
            Err(_) => return Err(Error::Other(anyhow::anyhow!("bw {redacted} timed out"))),
        };

        let duration_ms = start.elapsed().as_millis();
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let sanitized_stdout = sanitize_output(&stdout);
        let sanitized_stderr = sanitize_output(&stderr);

        let line = format!("bw {redacted} (exit={exit_code}, {duration_ms}ms)");
        self.push_trace(line.clone());
        tracing::info!(exit_code, duration_ms, "{line}");

        if exit_code != 0 {
            self.push_trace(sanitized_stderr.clone());
            return Err(Error::CliExit {
                exit_code,
                stderr_tail: sanitized_stderr,
            });
        }

        Ok(RawOutput {
            stdout: sanitized_stdout,
            #[allow(dead_code)]
            stderr: sanitized_stderr,
        })
    }

    fn push_trace(&self, message: String) {
        self.trace.lock().unwrap().push(LogLine {
            time: Utc::now(),
            message,
        });
    }
}

struct RawOutput {
    stdout: String,
    stderr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_format_strings_match_cli_vocabulary() {
        assert_eq!(ExportFormat::Json.as_str(), "json");
        assert_eq!(ExportFormat::EncryptedJson.as_str(), "encrypted_json");
    }
}
