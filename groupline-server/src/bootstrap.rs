//! Shared-store bootstrap.
//!
//! Copies every group and membership from persistence into the shared
//! membership store. Writes are add-only, so running it on every instance
//! start is safe and never undoes a removal another instance already made.
//! Stale entries are cleared by the live event path, not here.

use std::time::Instant;

use anyhow::{Context, Result};

use crate::persistence::Persistence;
use crate::store::MembershipStore;

/// Counts from one bootstrap run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub groups: usize,
    pub memberships: usize,
}

pub async fn seed_shared_store(
    persistence: &dyn Persistence,
    store: &dyn MembershipStore,
) -> Result<SeedReport> {
    let started = Instant::now();
    let groups = persistence
        .all_memberships()
        .await
        .context("Failed to load memberships for bootstrap")?;
    store
        .seed(&groups)
        .await
        .context("Failed to seed shared membership store")?;

    let report = SeedReport {
        groups: groups.len(),
        memberships: groups.iter().map(|g| g.members.len()).sum(),
    };
    tracing::info!(
        groups = report.groups,
        memberships = report.memberships,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Shared store bootstrap complete"
    );
    Ok(report)
}
