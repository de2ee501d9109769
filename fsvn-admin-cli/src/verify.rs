//! Repository integrity check

use anyhow::{Result, bail};
use fsvn_core::Repository;

/// Verify revisions `start..=end` (default: everything) and print a summary
pub fn verify_repository(
    repo: &Repository,
    start_rev: Option<u64>,
    end_rev: Option<u64>,
    quiet: bool,
) -> Result<()> {
    let head = repo.youngest()?;
    let start = start_rev.unwrap_or(0);
    let end = end_rev.unwrap_or(head).min(head);
    if start > end {
        bail!("Empty revision range r{}..r{}", start, end);
    }

    if !quiet {
        println!("Verifying revisions {} to {}", start, end);
    }

    let report = repo.verify(start, end)?;
    for failure in &report.failures {
        eprintln!("  ERROR: r{}: {}", failure.revision, failure.message);
    }

    if !quiet {
        println!();
        println!("Verification summary:");
        println!("  Revisions verified: {}", report.revisions);
        println!("  Node records:       {}", report.nodes);
        println!("  File texts:         {} ({} bytes)", report.files, report.bytes);
        println!("  Errors:             {}", report.failures.len());
    }

    if !report.is_ok() {
        bail!("{} revision(s) failed verification", report.failures.len());
    }
    Ok(())
}
