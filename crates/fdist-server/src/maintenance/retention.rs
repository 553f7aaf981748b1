use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fdist_cas::{CasError, ContentStore, FileReference};
use fdist_config::{log_maint_debug, log_maint_info, log_maint_warn};
use fdist_registry::ReferenceUsage;

use super::Maintainer;
use crate::Result;

/// What retention may delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Unused references last modified longer ago than this are candidates
    pub max_unused_age: Duration,
    /// The newest candidates kept regardless of age
    pub keep_at_least: usize,
}

impl RetentionPolicy {
    pub fn new(max_unused_age: Duration) -> Self {
        Self {
            max_unused_age,
            keep_at_least: 0,
        }
    }

    pub fn from_config(config: &fdist_config::RetentionConfig) -> Self {
        Self {
            max_unused_age: config.max_unused_age(),
            keep_at_least: config.keep_at_least,
        }
    }
}

/// Outcome of one retention run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub scanned: usize,
    pub in_use: usize,
    pub too_young: usize,
    /// Old enough and unused, but protected by `keep_at_least`
    pub kept: usize,
    pub deleted: Vec<FileReference>,
    pub failed: usize,
    /// Another replica held the store lock
    pub skipped_locked: usize,
    pub partials_removed: usize,
}

/// Deletion candidates of one run, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPlan {
    pub cutoff: SystemTime,
    pub scanned: usize,
    pub in_use: usize,
    pub too_young: usize,
    pub kept: usize,
    pub failed: usize,
    pub candidates: Vec<(SystemTime, FileReference)>,
}

impl Default for RetentionPlan {
    fn default() -> Self {
        Self {
            cutoff: SystemTime::UNIX_EPOCH,
            scanned: 0,
            in_use: 0,
            too_young: 0,
            kept: 0,
            failed: 0,
            candidates: Vec::new(),
        }
    }
}

/// Deletes references no active application needs that have gone unused
/// for longer than the retention window.
pub struct RetentionMaintainer {
    store: ContentStore,
    usage: Arc<dyn ReferenceUsage>,
    policy: RetentionPolicy,
}

impl RetentionMaintainer {
    pub fn new(store: ContentStore, usage: Arc<dyn ReferenceUsage>, policy: RetentionPolicy) -> Self {
        Self {
            store,
            usage,
            policy,
        }
    }

    /// Classify every reference without deleting anything.
    pub fn plan(&self) -> Result<RetentionPlan> {
        let mut plan = RetentionPlan {
            cutoff: SystemTime::now()
                .checked_sub(self.policy.max_unused_age)
                .unwrap_or(SystemTime::UNIX_EPOCH),
            ..RetentionPlan::default()
        };

        let in_use = self.usage.references_in_use()?;
        let mut candidates: Vec<(SystemTime, FileReference)> = Vec::new();
        for reference in self.store.list_references()? {
            plan.scanned += 1;
            if in_use.contains(&reference) {
                plan.in_use += 1;
                continue;
            }
            match self.store.last_modified(&reference) {
                Ok(modified) if modified > plan.cutoff => plan.too_young += 1,
                Ok(modified) => candidates.push((modified, reference)),
                // Deleted by someone else since the listing
                Err(CasError::NotFound { .. }) => {}
                Err(e) => {
                    log_maint_warn!("Cannot read blob age", reference = %reference, error = %e);
                    plan.failed += 1;
                }
            }
        }

        // Oldest first; the newest `keep_at_least` survive
        candidates.sort();
        let deletable = candidates.len().saturating_sub(self.policy.keep_at_least);
        plan.kept = candidates.len() - deletable;
        plan.candidates = candidates.into_iter().take(deletable).collect();
        Ok(plan)
    }

    /// One pass over the store.
    ///
    /// Fails only if the liveness set or the store listing is unavailable;
    /// problems with single references are counted in the report.
    pub fn delete_unused(&self) -> Result<RetentionReport> {
        let plan = self.plan()?;
        let cutoff = plan.cutoff;
        let mut report = RetentionReport {
            scanned: plan.scanned,
            in_use: plan.in_use,
            too_young: plan.too_young,
            kept: plan.kept,
            failed: plan.failed,
            ..RetentionReport::default()
        };

        for (_, reference) in plan.candidates {
            let still_needed = |r: &FileReference| {
                self.usage.is_in_use(r)
                    || self
                        .store
                        .last_modified(r)
                        .map(|modified| modified > cutoff)
                        .unwrap_or(false)
            };
            match self.store.delete(&reference, still_needed) {
                Ok(true) => report.deleted.push(reference),
                Ok(false) => report.in_use += 1,
                Err(CasError::Lock(e)) if e.is_timeout() => {
                    log_maint_debug!("Store locked by another replica", reference = %reference);
                    report.skipped_locked += 1;
                }
                Err(e) => {
                    log_maint_warn!("Failed to delete unused file", reference = %reference, error = %e);
                    report.failed += 1;
                }
            }
        }

        match self.store.sweep_partials(self.policy.max_unused_age) {
            Ok(removed) => report.partials_removed = removed,
            Err(e) => log_maint_warn!("Failed to sweep partial writes", error = %e),
        }

        Ok(report)
    }
}

impl Maintainer for RetentionMaintainer {
    fn name(&self) -> &'static str {
        "retention"
    }

    fn run_once(&mut self) {
        match self.delete_unused() {
            Ok(report) => log_maint_info!(
                "Retention run finished",
                scanned = report.scanned,
                in_use = report.in_use,
                too_young = report.too_young,
                kept = report.kept,
                deleted = report.deleted.len(),
                failed = report.failed,
                skipped_locked = report.skipped_locked
            ),
            Err(e) if is_lock_timeout(&e) => {
                log_maint_debug!("Retention skipped, another replica holds the lock", error = %e)
            }
            Err(e) => log_maint_warn!("Retention run failed", error = %e),
        }
    }
}

fn is_lock_timeout(e: &crate::ServerError) -> bool {
    match e {
        crate::ServerError::Registry(e) => e.is_lock_timeout(),
        crate::ServerError::Store(CasError::Lock(e)) => e.is_timeout(),
        _ => false,
    }
}

/// Delete unused references from the store at `root` in one pass.
pub fn delete_unused(
    root: &Path,
    max_age: Duration,
    usage: Arc<dyn ReferenceUsage>,
) -> Result<RetentionReport> {
    let store = ContentStore::new(root)?;
    RetentionMaintainer::new(store, usage, RetentionPolicy::new(max_age)).delete_unused()
}
