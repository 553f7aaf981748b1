//! Periodic maintenance keeping "files on disk" converged with "files needed".
//!
//! [`RetentionMaintainer`] deletes what no active application uses any more;
//! [`PackageRedownloader`] fetches active packages that went missing. Both
//! tolerate other replicas doing the same work and simply retry next tick.

mod redownload;
mod retention;
mod scheduler;

pub use redownload::{PackageRedownloader, RedownloadReport};
pub use retention::{delete_unused, RetentionMaintainer, RetentionPlan, RetentionPolicy, RetentionReport};
pub use scheduler::{Maintainer, PeriodicJob};
