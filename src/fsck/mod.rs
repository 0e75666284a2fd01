//! Disk ↔ index reconciliation.
//!
//! Five independent checks compare the live directory tree with the
//! logical state of the RECENT hierarchy, and an opt-in repair pass
//! brings the two back in line. The checks never mutate anything.

use std::collections::BTreeMap;

use crate::{Result, collection::Recent};

mod checks;
mod repair;

/// Controls fsck behavior.
#[derive(Debug, Clone, Default)]
pub struct Options {
   /// Repair issues after reporting them.
   pub repair: bool,
   /// Skip event parsing and the index→disk check (faster, less
   /// thorough).
   pub skip_events: bool,
   /// Check everything and log every finding; without it the
   /// index→disk check stats only a sample.
   pub verbose: bool,
}

/// Fsck findings.
#[derive(Debug, Clone, Default)]
pub struct Report {
   /// Total issues found across all checks.
   pub issues: usize,
   /// Issues per check.
   pub by_check: BTreeMap<&'static str, usize>,
   /// Whether a repair pass ran.
   pub repaired: bool,
   /// Epochs snapped onto the 10 µs grid during repair.
   pub epochs_quantized: usize,
   /// Epoch collisions resolved during repair.
   pub epochs_deduplicated: usize,
}

/// Runs all checks in order, then repairs when requested and needed.
pub fn run(rec: &Recent, opts: &Options) -> Result<Report> {
   tracing::info!(
      repair = opts.repair,
      skip_events = opts.skip_events,
      verbose = opts.verbose,
      "starting fsck"
   );

   let mut report = Report::default();

   report
      .by_check
      .insert("hierarchy", checks::check_hierarchy(rec, opts));
   report
      .by_check
      .insert("file_integrity", checks::check_file_integrity(rec, opts));
   report
      .by_check
      .insert("orphaned_files", checks::check_orphaned_files(rec, opts));
   report
      .by_check
      .insert("disk_index", checks::check_disk_matches_index(rec, opts));

   if opts.skip_events {
      tracing::debug!("skipping event-to-filesystem verification");
   } else {
      report
         .by_check
         .insert("index_disk", checks::check_events_match_filesystem(rec, opts));
   }

   report.issues = report.by_check.values().sum();

   tracing::info!(issues = report.issues, "fsck checks complete");

   if report.issues > 0 && opts.repair {
      tracing::info!(count = report.issues, "attempting repair");
      let (quantized, deduplicated) = repair::repair(rec, opts)?;
      report.repaired = true;
      report.epochs_quantized = quantized;
      report.epochs_deduplicated = deduplicated;
      tracing::info!("repair complete");
   }

   Ok(report)
}
