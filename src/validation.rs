//! Invariant checks shared by whatever surface mutates tasks and
//! destinations. The thin HTTP adapter in [`crate::api`] is the only
//! in-tree caller today, but these are kept free of any transport
//! concern so a future full CRUD surface can reuse them unchanged.

use cron::Schedule;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::store::models::{BackupDestination, DestinationKind};

/// A cron expression is either empty (manual-only task) or 5/6 space
/// separated fields that the `cron` crate can actually parse once
/// normalized. Mirrors [`crate::scheduler::normalize_cron`] rather than
/// calling it, since that function is private to the scheduler module.
pub fn validate_cron_expression(expr: &str) -> Result<()> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Ok(());
    }
    let fields = trimmed.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {trimmed}"),
        6 => trimmed.to_string(),
        _ => {
            return Err(Error::config(format!(
                "cron expression must have 5 or 6 fields, got {fields}: '{trimmed}'"
            )))
        }
    };
    Schedule::from_str(&normalized)
        .map(|_| ())
        .map_err(|e| Error::config(format!("invalid cron expression '{trimmed}': {e}")))
}

/// A `server` destination may not target the same server a task backs up
/// from — that would be a vault importing into itself.
pub fn validate_source_destination(source_server_id: i64, destination: &BackupDestination) -> Result<()> {
    if destination.kind == Some(DestinationKind::Server) && destination.target_server_id == Some(source_server_id) {
        return Err(Error::config(
            "a server destination cannot target its own task's source server",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_expression_is_manual_only_and_valid() {
        assert!(validate_cron_expression("").is_ok());
        assert!(validate_cron_expression("   ").is_ok());
    }

    #[test]
    fn five_and_six_field_expressions_are_accepted() {
        assert!(validate_cron_expression("*/5 * * * *").is_ok());
        assert!(validate_cron_expression("0 */5 * * * *").is_ok());
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert!(validate_cron_expression("not a cron").is_err());
        assert!(validate_cron_expression("* * *").is_err());
    }

    #[test]
    fn server_destination_cannot_target_its_own_source() {
        let dest = BackupDestination {
            kind: Some(DestinationKind::Server),
            target_server_id: Some(1),
            ..Default::default()
        };
        assert!(validate_source_destination(1, &dest).is_err());
        assert!(validate_source_destination(2, &dest).is_ok());
    }

    #[test]
    fn non_server_destinations_are_never_rejected() {
        let dest = BackupDestination {
            kind: Some(DestinationKind::Local),
            target_server_id: Some(1),
            ..Default::default()
        };
        assert!(validate_source_destination(1, &dest).is_ok());
    }
}
