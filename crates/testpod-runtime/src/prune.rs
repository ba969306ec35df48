//! Removal of labelled containers left behind by earlier runs.

use std::time::Duration;

use chrono::Utc;
use testpod_common::error::Result;
use testpod_common::types::ContainerId;

use crate::backend::Backend;

/// What a prune pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Containers that were removed.
    pub removed: Vec<ContainerId>,
    /// Containers young enough to keep.
    pub kept: usize,
}

/// Removes containers labelled `<prefix>=true` created more than `max_age` ago.
///
/// Containers without a readable creation time are kept. Containers that
/// vanish mid-pass are skipped, and removal failures are logged.
///
/// # Errors
///
/// Returns an error only if the runtime cannot list containers.
pub fn prune_stale<B: Backend + ?Sized>(
    backend: &B,
    prefix: &str,
    max_age: Duration,
) -> Result<PruneReport> {
    let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    let now = Utc::now();
    let mut report = PruneReport::default();

    for id in backend.list_containers(&format!("{prefix}=true"))? {
        let info = match backend.inspect_container(&id) {
            Ok(info) => info,
            Err(e) if e.is_not_found() => continue,
            Err(e) => {
                tracing::warn!(id = %id.short(), error = %e, "cannot inspect container, keeping it");
                report.kept += 1;
                continue;
            }
        };
        let stale = info.created.is_some_and(|created| now - created > max_age);
        if !stale {
            report.kept += 1;
            continue;
        }
        match backend.remove_container(&id) {
            Ok(()) => {
                tracing::info!(id = %id.short(), name = %info.name, "removed stale container");
                report.removed.push(id);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(id = %id.short(), error = %e, "failed to remove stale container");
            }
        }
    }
    Ok(report)
}
