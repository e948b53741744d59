//! Destination provider abstraction: a uniform `Backup` operation plus an
//! optional `Cleanup` (retention) capability, one implementation per
//! storage kind, registered at startup in a type→provider registry.

pub mod local;
pub mod registry;
pub mod s3;
pub mod server;
pub mod webdav;

use async_trait::async_trait;

use crate::store::models::{BackupDestination, ServerConfig};

/// What a provider needs to place one artifact at its destination.
pub struct BackupContext<'a> {
    pub source_file_path: &'a str,
    pub task_name: &'a str,
    pub timestamp: &'a str,
    pub destination: &'a BackupDestination,
    /// Preloaded target vault credentials, present only for `server` destinations.
    pub target_server: Option<&'a ServerConfig>,
}

#[async_trait]
pub trait DestinationProvider: Send + Sync {
    /// Stores the artifact and returns a human-readable locator recorded in
    /// the execution log (absolute path, `https://…`, `s3://bucket/key`, or
    /// `server://<name>`).
    async fn backup(&self, ctx: &BackupContext<'_>) -> anyhow::Result<String>;
}

#[async_trait]
pub trait RetentionProvider: Send + Sync {
    /// No-op when `max_count <= 0`. Returns the number of deleted artifacts.
    /// Individual delete failures are swallowed.
    async fn cleanup(&self, destination: &BackupDestination, max_count: i64) -> anyhow::Result<usize>;
}

pub(crate) const BACKUP_FILE_PREFIX: &str = "backup_";

/// The name a provider stores the artifact under at its destination. This is
/// the same name whether the source artifact was the plaintext or the
/// vault-encrypted export — the `_encrypted` suffix only ever names the
/// `.tmp` working file the pipeline exports into, never the object placed at
/// a destination.
pub(crate) fn canonical_filename(task_name: &str, timestamp: &str) -> String {
    format!("{BACKUP_FILE_PREFIX}{task_name}_{timestamp}.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_follow_the_naming_convention_regardless_of_encryption() {
        assert_eq!(
            canonical_filename("nightly", "20260728_030000"),
            "backup_nightly_20260728_030000.json"
        );
    }
}
