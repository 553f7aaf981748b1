//! # Retention
//!
//! Deletes files no active application references and that have not been
//! touched within the retention window.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use clap::Args;
use fdist_config::Config;
use fdist_registry::ActiveApplications;
use fdist_server::maintenance::{RetentionMaintainer, RetentionPolicy};

use crate::open_store;

#[derive(Args, Debug)]
pub struct GcArgs {
    /// Actually delete files (default is dry-run)
    #[arg(long)]
    delete: bool,

    /// Only delete files unused for longer than this (e.g. "90m", "24h", "14d")
    #[arg(long)]
    older_than: Option<String>,

    /// Keep this many of the newest unused files regardless of age
    #[arg(long)]
    keep_at_least: Option<usize>,
}

pub fn run(config: &Config, args: GcArgs) -> Result<()> {
    let mut policy = RetentionPolicy::from_config(&config.retention);
    if let Some(age) = &args.older_than {
        policy.max_unused_age = parse_age(age)?;
    }
    if let Some(keep) = args.keep_at_least {
        policy.keep_at_least = keep;
    }

    let store = open_store(config)?;
    let usage = Arc::new(ActiveApplications::new(config.state_dir(), config.lock.timeout()));
    let maintainer = RetentionMaintainer::new(store.clone(), usage, policy);

    println!();
    println!("  fdist retention");
    println!("  ===============");

    let plan = maintainer
        .plan()
        .context("Cannot determine which files are in use")?;
    let now = SystemTime::now();
    let candidate_bytes: u64 = plan
        .candidates
        .iter()
        .map(|(_, r)| blob_size(&store, r))
        .sum();

    println!();
    println!("  Store: {}", store.root().display());
    println!("    Scanned:      {}", format_number(plan.scanned as u64));
    println!("    In use:       {}", format_number(plan.in_use as u64));
    println!(
        "    Too young:    {} (window {})",
        format_number(plan.too_young as u64),
        format_age(policy.max_unused_age)
    );
    if plan.kept > 0 {
        println!("    Kept newest:  {}", format_number(plan.kept as u64));
    }
    println!(
        "    Unused:       {} ({})",
        format_number(plan.candidates.len() as u64),
        format_bytes(candidate_bytes)
    );

    if !args.delete {
        if !plan.candidates.is_empty() {
            println!();
            for (modified, reference) in &plan.candidates {
                let age = now.duration_since(*modified).unwrap_or_default();
                println!("    {}  unused for {}", reference, format_age(age));
            }
        }
        println!();
        println!("  Dry run complete. Use --delete to remove unused files.");
        println!();
        return Ok(());
    }

    let report = maintainer.delete_unused()?;
    println!();
    println!("  Deleted: {} files", format_number(report.deleted.len() as u64));
    if report.skipped_locked > 0 {
        println!("  Skipped {} files, store locked by another host", report.skipped_locked);
    }
    if report.partials_removed > 0 {
        println!("  Removed {} abandoned partial writes", report.partials_removed);
    }
    if report.failed > 0 {
        println!("  Failed:  {} (see log)", report.failed);
    }
    println!();
    Ok(())
}

fn blob_size(store: &fdist_cas::ContentStore, reference: &fdist_cas::FileReference) -> u64 {
    walkdir::WalkDir::new(store.blob_dir(reference))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

/// Parse "45s", "90m", "24h" or "14d"; a bare number is seconds.
fn parse_age(value: &str) -> Result<Duration> {
    let value = value.trim();
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => value.split_at(idx),
        None => (value, "s"),
    };
    let amount: u64 = digits
        .parse()
        .with_context(|| format!("Invalid age {:?}", value))?;
    let secs = match unit {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        "d" => amount * 86400,
        _ => bail!("Invalid age unit in {:?} (use s, m, h or d)", value),
    };
    Ok(Duration::from_secs(secs))
}

fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    if secs >= 86400 {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Binary-prefixed size, two decimals above 1 KiB.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} bytes", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// `1234567` -> `1,234,567`
pub(crate) fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
