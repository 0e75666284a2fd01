//! Fsck driver: verify and repair a RECENT hierarchy.

use std::path::PathBuf;

use console::style;

use crate::{Result, collection::Recent, error::Error, fsck};

pub fn execute(principal_file: PathBuf, repair: bool, skip_events: bool, verbose: bool) -> Result<()> {
   let principal_path = principal_file
      .canonicalize()
      .map_err(|e| Error::from(e).context("resolve principal", &principal_file))?;

   if verbose {
      println!("Checking RECENT collection: {}", style(principal_path.display()).cyan());
   }

   let rec = Recent::open(&principal_path)?;
   let report = fsck::run(&rec, &fsck::Options { repair, skip_events, verbose })?;

   let stats = rec.stats();
   println!("\n{}", style("=== Summary ===").bold());
   println!("Intervals: {}", stats.intervals);
   println!("Total events: {}", stats.total_events);
   println!("\nPer-interval statistics:");
   for (interval, file) in &stats.files {
      print!("  {}: {} events, {} bytes", style(interval).cyan(), file.events, file.size);
      if file.mtime > 0 {
         print!(", modified: {}", file.mtime);
      }
      println!();
   }

   println!("\nIssues found: {}", report.issues);
   for (check, count) in &report.by_check {
      if *count > 0 {
         println!("  {check}: {count}");
      }
   }

   if report.issues == 0 {
      println!("{}", style("✓ No issues").green());
      return Ok(());
   }

   if report.repaired {
      println!("{}", style("✓ Repair complete").green());
      if report.epochs_quantized > 0 {
         println!("  quantized {} epochs to 10µs precision", report.epochs_quantized);
      }
      if report.epochs_deduplicated > 0 {
         println!("  fixed {} epoch collisions", report.epochs_deduplicated);
      }
      return Ok(());
   }

   Err(Error::FsckIssues { issues: report.issues })
}
