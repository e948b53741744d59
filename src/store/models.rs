//! Entity shapes persisted by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Id = i64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: Id,
    pub name: String,
    pub url: String,
    pub client_id: String,
    pub client_secret: String,
    pub master_password: String,
    pub is_official: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationKind {
    Local,
    Webdav,
    S3,
    Server,
}

impl DestinationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::Local => "local",
            DestinationKind::Webdav => "webdav",
            DestinationKind::S3 => "s3",
            DestinationKind::Server => "server",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupDestination {
    pub id: Id,
    pub name: String,
    pub kind: Option<DestinationKind>,

    pub local_path: String,

    pub webdav_url: String,
    pub webdav_username: String,
    pub webdav_password: String,
    pub webdav_path: String,

    pub s3_endpoint: String,
    pub s3_region: String,
    pub s3_bucket: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub s3_path: String,

    pub target_server_id: Option<Id>,

    pub encrypted: bool,
    pub encryption_password: String,
    pub max_backup_count: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for DestinationKind {
    fn default() -> Self {
        DestinationKind::Local
    }
}

#[derive(Debug, Clone)]
pub struct BackupTask {
    pub id: Id,
    pub name: String,
    pub source_server_id: Id,
    pub cron_expression: String,
    pub enabled: bool,
    pub destinations: Vec<BackupDestination>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackupTask {
    pub fn is_manual_only(&self) -> bool {
        self.cron_expression.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStatus {
    Running,
    Success,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Running => "running",
            LogStatus::Success => "success",
            LogStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub time: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupLog {
    pub id: Id,
    pub task_id: Id,
    pub status: LogStatus,
    pub message: String,
    pub backup_file: String,
    pub execution_logs: Vec<LogLine>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Masks a secret for external projection: `first4 + "****" + last4` for
/// length > 8, otherwise the literal `"****"`.
pub fn mask_secret(s: &str) -> String {
    if s.len() > 8 {
        format!("{}****{}", &s[..4], &s[s.len() - 4..])
    } else {
        "****".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_long_secrets() {
        assert_eq!(mask_secret("abcdefghij"), "abcd****ghij");
    }

    #[test]
    fn masks_short_secrets_fully() {
        for s in ["", "a", "abcdefgh"] {
            assert_eq!(mask_secret(s), "****");
        }
    }

    #[test]
    fn boundary_is_inclusive_at_eight() {
        assert_eq!(mask_secret("12345678").len(), 4);
        assert_eq!(mask_secret("123456789"), "1234****6789");
    }

    proptest::proptest! {
        /// §8 property 8: the `> 8` / `<= 8` length boundary holds for any
        /// ASCII input (restricted to single-byte chars so the `&s[..4]`
        /// slicing can never land mid-codepoint).
        #[test]
        fn mask_secret_boundary_holds(s in "[ -~]{0,40}") {
            if s.len() > 8 {
                let masked = mask_secret(&s);
                proptest::prop_assert_eq!(&masked[..4], &s[..4]);
                proptest::prop_assert_eq!(&masked[masked.len() - 4..], &s[s.len() - 4..]);
                proptest::prop_assert_eq!(masked.len(), 12);
            } else {
                proptest::prop_assert_eq!(mask_secret(&s), "****");
            }
        }
    }
}
