use std::path::Path;

use async_trait::async_trait;

use crate::providers::{canonical_filename, BackupContext, DestinationProvider, RetentionProvider, BACKUP_FILE_PREFIX};
use crate::store::models::BackupDestination;

pub struct LocalProvider;

#[async_trait]
impl DestinationProvider for LocalProvider {
    async fn backup(&self, ctx: &BackupContext<'_>) -> anyhow::Result<String> {
        let dir = Path::new(&ctx.destination.local_path);
        tokio::fs::create_dir_all(dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(dir).await?.permissions();
            perms.set_mode(0o755);
            tokio::fs::set_permissions(dir, perms).await?;
        }

        let filename = canonical_filename(ctx.task_name, ctx.timestamp);
        let target = dir.join(&filename);
        tokio::fs::copy(ctx.source_file_path, &target).await?;
        Ok(target.to_string_lossy().into_owned())
    }
}

#[async_trait]
impl RetentionProvider for LocalProvider {
    async fn cleanup(&self, destination: &BackupDestination, max_count: i64) -> anyhow::Result<usize> {
        if max_count <= 0 {
            return Ok(0);
        }
        let dir = Path::new(&destination.local_path);
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(BACKUP_FILE_PREFIX) || !name.ends_with(".json") {
                continue;
            }
            let modified = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            entries.push((entry.path(), modified));
        }
        entries.sort_by(|a, b| b.1.cmp(&a.1));

        let mut deleted = 0;
        for (path, _) in entries.into_iter().skip(max_count as usize) {
            if tokio::fs::remove_file(&path).await.is_ok() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{BackupDestination, DestinationKind};

    fn dest(path: &str, max_count: i64) -> BackupDestination {
        BackupDestination {
            kind: Some(DestinationKind::Local),
            local_path: path.to_string(),
            max_backup_count: max_count,
            enabled: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn backup_writes_namespaced_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.json");
        tokio::fs::write(&src, b"{}").await.unwrap();

        let destination = dest(dir.path().to_str().unwrap(), 0);
        let ctx = BackupContext {
            source_file_path: src.to_str().unwrap(),
            task_name: "nightly",
            timestamp: "20260728_030000",
            destination: &destination,
            target_server: None,
        };
        let stored = LocalProvider.backup(&ctx).await.unwrap();
        assert!(stored.ends_with("backup_nightly_20260728_030000.json"));
        assert!(tokio::fs::metadata(&stored).await.is_ok());
    }

    #[tokio::test]
    async fn cleanup_keeps_only_the_most_recent_n() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            let name = format!("backup_x_2026072{i}_000000.json");
            tokio::fs::write(dir.path().join(&name), b"{}").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let destination = dest(dir.path().to_str().unwrap(), 2);
        let deleted = LocalProvider.cleanup(&destination, 2).await.unwrap();
        assert_eq!(deleted, 3);

        let mut remaining = 0;
        let mut rd = tokio::fs::read_dir(dir.path()).await.unwrap();
        while rd.next_entry().await.unwrap().is_some() {
            remaining += 1;
        }
        assert_eq!(remaining, 2);
    }

    #[tokio::test]
    async fn cleanup_is_noop_when_max_count_not_positive() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dest(dir.path().to_str().unwrap(), 0);
        assert_eq!(LocalProvider.cleanup(&destination, 0).await.unwrap(), 0);
    }
}
