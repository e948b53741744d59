//! Per-task orchestrator: source auth → export → fan-out → retention → log.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::providers::registry::Registry;
use crate::providers::BackupContext;
use crate::store::models::{BackupTask, DestinationKind, Id, LogLine, LogStatus};
use crate::store::Store;
use crate::vault_cli::{Driver, ExportFormat};

pub struct Pipeline {
    settings: Settings,
    store: Arc<Store>,
    registry: Arc<Registry>,
    cli_mutex: Arc<AsyncMutex<()>>,
}

struct Artifacts {
    plaintext: Option<PathBuf>,
    encrypted: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(settings: Settings, store: Arc<Store>, registry: Arc<Registry>, cli_mutex: Arc<AsyncMutex<()>>) -> Self {
        Self {
            settings,
            store,
            registry,
            cli_mutex,
        }
    }

    /// Runs one execution of `task`, recording the outcome on `log_id`.
    /// Temporary artifacts are guaranteed to be removed on every exit path.
    pub async fn run(&self, task: &BackupTask, log_id: Id) -> Result<()> {
        let start = Utc::now();
        let outcome = self.try_run(task).await;

        let (status, message, backup_file, trace) = match outcome {
            Ok((msg, file, trace)) => (LogStatus::Success, msg, file, trace),
            Err((e, trace)) => (LogStatus::Failed, e.to_string(), String::new(), trace),
        };

        self.store
            .finish_log(log_id, status, &message, &backup_file, &trace, Utc::now())
            .await?;

        if status == LogStatus::Failed {
            tracing::warn!(task = %task.name, "backup failed: {message}");
        }
        let _ = start;
        Ok(())
    }

    async fn try_run(&self, task: &BackupTask) -> std::result::Result<(String, String, Vec<LogLine>), (Error, Vec<LogLine>)> {
        let source = match self.store.get_server_config(task.source_server_id).await {
            Ok(Some(s)) => s,
            Ok(None) => return Err((Error::config("source server not found"), Vec::new())),
            Err(e) => return Err((e, Vec::new())),
        };

        let driver = Driver::new(self.settings.bw_binary.clone(), self.cli_mutex.clone(), self.settings.pipeline_deadline);

        let result: Result<(String, String)> = async {
            let _ = driver.logout().await;
            self.authenticate(&driver, &source.url, &source.client_id, &source.client_secret, &source.master_password)
                .await?;

            let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
            let enabled: Vec<_> = task.destinations.iter().filter(|d| d.enabled).collect();

            let need_plaintext = enabled.iter().any(|d| {
                d.kind == Some(DestinationKind::Server)
                    || (d.kind != Some(DestinationKind::Server) && !d.encrypted)
            });
            let need_encrypted = enabled
                .iter()
                .any(|d| d.kind != Some(DestinationKind::Server) && d.encrypted);
            let encryption_password = enabled
                .iter()
                .filter(|d| d.encrypted)
                .find_map(|d| (!d.encryption_password.is_empty()).then(|| d.encryption_password.clone()));
            if need_encrypted && encryption_password.is_none() {
                return Err(Error::config("encrypted destination requires an encryption_password"));
            }

            let tmp_dir = self.temp_dir().await?;
            // Every artifact is pushed onto `created` the instant it lands on
            // disk, so a later export failing mid-way (e.g. plaintext
            // succeeds, encrypted fails) still leaves nothing behind.
            let mut created: Vec<PathBuf> = Vec::new();
            let artifacts = self
                .export_artifacts(
                    &driver,
                    &tmp_dir,
                    &task.name,
                    &timestamp,
                    need_plaintext,
                    need_encrypted,
                    encryption_password.as_deref(),
                    &mut created,
                )
                .await;

            let artifacts = match artifacts {
                Ok(a) => a,
                Err(e) => {
                    cleanup_paths(&created);
                    return Err(e);
                }
            };

            let fan_out = self.fan_out(&enabled, &artifacts, &task.name, &timestamp).await;
            cleanup_paths(&created);

            let _ = driver.logout().await;

            fan_out
        }
        .await;

        let trace = driver.trace();
        match result {
            Ok((msg, file)) => Ok((msg, file, trace)),
            Err(e) => Err((e, trace)),
        }
    }

    async fn authenticate(
        &self,
        driver: &Driver,
        url: &str,
        client_id: &str,
        client_secret: &str,
        master_password: &str,
    ) -> Result<()> {
        driver.config_server(url).await?;
        driver.login(client_id, client_secret).await?;
        driver.sync().await?;
        match driver.unlock(master_password).await {
            Ok(_) => Ok(()),
            Err(Error::NotLoggedIn) => {
                let _ = driver.logout().await;
                driver.login(client_id, client_secret).await?;
                driver.sync().await?;
                driver.unlock(master_password).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn temp_dir(&self) -> Result<PathBuf> {
        let dir = PathBuf::from(".tmp");
        match tokio::fs::create_dir_all(&dir).await {
            Ok(_) => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Ok(meta) = tokio::fs::metadata(&dir).await {
                        let mut perms = meta.permissions();
                        perms.set_mode(0o700);
                        let _ = tokio::fs::set_permissions(&dir, perms).await;
                    }
                }
                Ok(dir)
            }
            Err(_) => Ok(std::env::temp_dir()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn export_artifacts(
        &self,
        driver: &Driver,
        tmp_dir: &Path,
        task_name: &str,
        timestamp: &str,
        need_plaintext: bool,
        need_encrypted: bool,
        encryption_password: Option<&str>,
        created: &mut Vec<PathBuf>,
    ) -> Result<Artifacts> {
        let mut plaintext = None;
        let mut encrypted = None;

        if need_plaintext {
            let path = tmp_dir.join(format!("backup_{task_name}_{timestamp}.json"));
            driver.export(&path.to_string_lossy(), ExportFormat::Json, None, None).await?;
            created.push(path.clone());
            plaintext = Some(path);
        }
        if need_encrypted {
            let path = tmp_dir.join(format!("backup_{task_name}_{timestamp}_encrypted.json"));
            driver
                .export(&path.to_string_lossy(), ExportFormat::EncryptedJson, encryption_password, None)
                .await?;
            created.push(path.clone());
            encrypted = Some(path);
        }

        Ok(Artifacts { plaintext, encrypted })
    }

    async fn fan_out(
        &self,
        enabled: &[&crate::store::models::BackupDestination],
        artifacts: &Artifacts,
        task_name: &str,
        timestamp: &str,
    ) -> Result<(String, String)> {
        let mut success_count = 0usize;
        let mut fail_count = 0usize;
        let mut last_error: Option<anyhow::Error> = None;
        let mut first_success_path: Option<String> = None;

        for dest in enabled {
            let kind = dest.kind.unwrap_or(DestinationKind::Local);
            let artifact = if dest.encrypted && kind != DestinationKind::Server {
                artifacts.encrypted.as_ref()
            } else {
                artifacts.plaintext.as_ref()
            };
            let Some(artifact) = artifact else {
                fail_count += 1;
                last_error = Some(anyhow::anyhow!("no artifact prepared for destination {}", dest.name));
                continue;
            };

            let target_server = if kind == DestinationKind::Server {
                match dest.target_server_id {
                    Some(id) => match self.store.get_server_config(id).await {
                        Ok(s) => s,
                        Err(e) => {
                            fail_count += 1;
                            last_error = Some(e.into());
                            continue;
                        }
                    },
                    None => None,
                }
            } else {
                None
            };

            let ctx = BackupContext {
                source_file_path: artifact.to_str().unwrap(),
                task_name,
                timestamp,
                destination: dest,
                target_server: target_server.as_ref(),
            };

            match self.registry.backup_provider(kind).backup(&ctx).await {
                Ok(stored_path) => {
                    success_count += 1;
                    if first_success_path.is_none() {
                        first_success_path = Some(stored_path);
                    }
                    if dest.max_backup_count > 0 {
                        if let Some(retention) = self.registry.retention_provider(kind) {
                            if let Err(e) = retention.cleanup(dest, dest.max_backup_count).await {
                                tracing::warn!(destination = %dest.name, "retention cleanup failed: {e}");
                            }
                        }
                    }
                }
                Err(e) => {
                    fail_count += 1;
                    tracing::warn!(destination = %dest.name, "backup destination failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        if success_count > 0 {
            Ok((
                "backup completed".to_string(),
                first_success_path.unwrap_or_default(),
            ))
        } else {
            let last = last_error.map(|e| e.to_string()).unwrap_or_else(|| "unknown error".to_string());
            Err(Error::config(format!("all {fail_count} backup destinations failed: {last}")))
        }
    }
}

/// Removes every path that was actually created, regardless of where in the
/// pipeline the run ultimately failed. Individual removal failures are
/// ignored: the directory itself (or a concurrent cleanup) may already have
/// taken care of it.
fn cleanup_paths(paths: &[PathBuf]) {
    for path in paths {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cleanup_paths_removes_every_entry_even_after_a_partial_export() {
        let dir = tempfile::tempdir().unwrap();
        let plaintext = dir.path().join("backup_t_20260728_030000.json");
        tokio::fs::write(&plaintext, b"{}").await.unwrap();

        // Simulates the encrypted export failing after the plaintext one
        // already landed on disk: only the plaintext path made it into
        // `created` before the failure.
        let created = vec![plaintext.clone()];
        cleanup_paths(&created);

        assert!(tokio::fs::metadata(&plaintext).await.is_err());
    }
}
