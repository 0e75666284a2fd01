//! Opt-in fsck repair.
//!
//! Disk is authoritative: files present on disk but absent from the
//! index get a `new` event, indexed paths missing from disk get a
//! `delete` event. Both are written at the current epoch; synthesizing
//! epochs from file mtimes would plant old events that never age out
//! and bloat every file they merge into. A final pass quantizes all
//! stored epochs to 10 µs and resolves collisions.

use crate::{
   Result,
   collection::Recent,
   recentfile::{BatchItem, EventType, Recentfile, deduplicate_epochs},
};

use super::{Options, checks};

pub(super) fn repair(rec: &Recent, opts: &Options) -> Result<(usize, usize)> {
   rec.ensure_files_exist()?;
   if opts.verbose {
      tracing::debug!("all recentfiles exist");
   }

   repair_disk_orphans(rec, opts)?;
   repair_index_orphans(rec, opts)?;
   repair_epochs(rec, opts)
}

/// Files on disk that the index does not know about get a `new` event
/// in the principal.
fn repair_disk_orphans(rec: &Recent, opts: &Options) -> Result<()> {
   let index_paths = checks::build_index_state(rec)?;

   let mut batch: Vec<BatchItem> = Vec::new();
   checks::walk_tree(rec, |rel| {
      if !index_paths.contains(rel) {
         if opts.verbose {
            tracing::debug!("adding to index: {rel}");
         }
         batch.push(BatchItem::new(rel, EventType::New));
      }
   });

   if batch.is_empty() {
      if opts.verbose {
         tracing::debug!("no disk orphans to add");
      }
      return Ok(());
   }

   tracing::info!(count = batch.len(), "adding files to index");
   rec.batch_update(&batch)
}

/// Indexed paths missing from disk get a `delete` event in the
/// principal.
fn repair_index_orphans(rec: &Recent, opts: &Options) -> Result<()> {
   let disk = checks::disk_paths(rec);
   let index_paths = checks::build_index_state(rec)?;

   let mut batch: Vec<BatchItem> = index_paths
      .into_iter()
      .filter(|path| !disk.contains(path))
      .map(|path| {
         if opts.verbose {
            tracing::debug!("marking deleted: {path}");
         }
         BatchItem::new(path, EventType::Delete)
      })
      .collect();
   batch.sort_by(|a, b| a.path.cmp(&b.path));

   if batch.is_empty() {
      if opts.verbose {
         tracing::debug!("no index orphans to delete");
      }
      return Ok(());
   }

   tracing::info!(count = batch.len(), "adding delete events for missing files");
   rec.batch_update(&batch)
}

/// Quantizes epochs in every file and resolves collisions, rewriting
/// only files that changed.
fn repair_epochs(rec: &Recent, opts: &Options) -> Result<(usize, usize)> {
   let mut quantized = 0;
   let mut deduplicated = 0;

   for rf in rec.recentfiles() {
      let (q, d) = repair_epochs_in_file(rf)
         .map_err(|e| e.context("repair epochs", rf.rfile()))?;
      quantized += q;
      deduplicated += d;

      if opts.verbose && (q > 0 || d > 0) {
         tracing::debug!(
            quantized = q,
            deduplicated = d,
            "repaired epochs in {}",
            rf.rfile().display()
         );
      }
   }

   if quantized > 0 || deduplicated > 0 {
      tracing::info!(quantized, deduplicated, "epoch repair complete");
   } else if opts.verbose {
      tracing::debug!("no epochs needed repair");
   }

   Ok((quantized, deduplicated))
}

fn repair_epochs_in_file(rf: &Recentfile) -> Result<(usize, usize)> {
   match rf.read() {
      Ok(()) => {},
      Err(e) if e.is_not_found() => return Ok((0, 0)),
      Err(e) => return Err(e),
   }

   let mut events = rf.events();
   if events.is_empty() {
      return Ok((0, 0));
   }

   let mut quantized = 0;
   for event in &mut events {
      let snapped = event.epoch.quantized();
      if snapped != event.epoch {
         event.epoch = snapped;
         quantized += 1;
      }
   }

   let mut seen = std::collections::HashSet::with_capacity(events.len());
   let collisions = events
      .iter()
      .filter(|e| !seen.insert(e.epoch.to_bits()))
      .count();
   if collisions > 0 {
      events = deduplicate_epochs(events);
   }

   if quantized == 0 && collisions == 0 {
      return Ok((0, 0));
   }

   rf.replace_events(events);
   rf.lock()?;
   let written = rf.write();
   let unlock = rf.unlock();
   written?;
   unlock?;

   Ok((quantized, collisions))
}
