//! Upward aggregation across the interval hierarchy.
//!
//! Aggregation is a chain, not a star: each level merges from the
//! level below it, so events truncated out of the principal still flow
//! to the tail of the hierarchy. A level is merged when the target
//! file's age exceeds the interval of the level *before* the current
//! source; checking against the current source would stall the tail
//! (the week file would wait a full day before updating).

use std::{
   collections::{HashMap, HashSet},
   fs,
};

use crate::{
   Result,
   epoch::Epoch,
   error::Error,
   interval::Interval,
};

use super::{Event, Merged, Recentfile, sort_events_desc, update_minmax, update_producers};

impl Recentfile {
   /// Runs one aggregation pass, flowing events from this file through
   /// every larger interval in the aggregator list. `force` merges
   /// every level regardless of target age.
   pub fn aggregate(&self, force: bool) -> Result<()> {
      let mut intervals = self.meta().aggregator;
      intervals.sort();
      intervals.dedup();
      intervals.retain(|i| i.secs() > self.interval().secs());
      if intervals.is_empty() {
         return Ok(());
      }

      let mut prev_source_interval = self.interval();
      let mut source_owned: Option<Recentfile> = None;

      for target_interval in intervals {
         let target = source_owned
            .as_ref()
            .unwrap_or(self)
            .sparse_clone(target_interval);

         // The first level always merges; later levels only once the
         // target has aged past the previous source's window.
         let should_merge = force
            || source_owned.is_none()
            || should_merge_by_age(&target, prev_source_interval);
         if !should_merge {
            // The chain is strictly prefix-closed: a level that is not
            // ready stops the pass rather than being skipped over.
            break;
         }

         {
            let source = source_owned.as_ref().unwrap_or(self);
            target
               .merge_from(source)
               .map_err(|e| e.context("merge into", target.rfile()))?;

            if let Some(head) = target.with_state(|s| s.recent.first().map(|e| e.epoch)) {
               source.with_state_mut(|s| {
                  s.meta.merged =
                     Some(Merged { epoch: head, into_interval: Some(target_interval) });
               });
            }

            // Persist the merged pointer so the next pass can compute
            // its cutoff.
            source.lock()?;
            let written = source.write();
            let unlock = source.unlock();
            written?;
            unlock?;

            prev_source_interval = source.interval();
         }

         source_owned = Some(target);
      }

      Ok(())
   }

   /// Merges `source`'s events into this (larger-interval) file. Both
   /// files are locked and re-read; the result is written atomically.
   pub fn merge_from(&self, source: &Recentfile) -> Result<()> {
      if self.interval().secs() <= source.interval().secs() {
         return Err(Error::Invariant(format!(
            "cannot merge {} into {}: target interval must be larger",
            source.interval(),
            self.interval(),
         )));
      }

      self.lock()?;
      let result = (|| {
         source.lock()?;
         let merged = self.merge_from_locked(source);
         let unlock = source.unlock();
         merged?;
         unlock
      })();
      let unlock = self.unlock();
      result?;
      unlock
   }

   fn merge_from_locked(&self, source: &Recentfile) -> Result<()> {
      match self.read() {
         Ok(()) => {},
         Err(e) if e.is_not_found() => {},
         Err(e) => return Err(e),
      }
      source.read()?;

      let now = Epoch::now();

      self.with_state_mut(|target| {
         source.with_state(|src| {
            // The cutoff must be computed before any metadata is
            // copied across.
            let mut oldest_allowed = if target.meta.dirtymark != src.meta.dirtymark {
               // A diverging dirtymark means the streams are being
               // re-synced; age filtering would lose history.
               Epoch::ZERO
            } else if let Some(merged) = &target.meta.merged
               && !merged.epoch.is_zero()
            {
               let mut oldest = merged.epoch;
               if !self.interval().is_infinite() {
                  let cutoff = now.sub_secs(self.interval().secs() as f64);
                  if cutoff < oldest {
                     oldest = cutoff;
                  }
               }
               oldest
            } else {
               // First merge into this target: keep everything so the
               // new file is fully populated.
               Epoch::ZERO
            };

            // Never drop events the source still carries.
            if let Some(last) = src.recent.last()
               && !oldest_allowed.is_zero()
               && last.epoch < oldest_allowed
            {
               oldest_allowed = last.epoch;
            }

            let mut by_path: HashMap<&str, &Event> =
               HashMap::with_capacity(target.recent.len() + src.recent.len());
            for event in &target.recent {
               if !oldest_allowed.is_zero() && event.epoch < oldest_allowed {
                  continue;
               }
               by_path.insert(event.path.as_str(), event);
            }
            for event in &src.recent {
               if !oldest_allowed.is_zero() && event.epoch < oldest_allowed {
                  continue;
               }
               let newer = match by_path.get(event.path.as_str()) {
                  Some(existing) => event.epoch > existing.epoch,
                  None => true,
               };
               if newer {
                  by_path.insert(event.path.as_str(), event);
               }
            }

            let mut events: Vec<Event> = by_path.into_values().cloned().collect();
            sort_events_desc(&mut events);
            // Filtering already happened through oldest_allowed;
            // update-time truncation here would drop events a first
            // merge deliberately kept.
            target.recent = deduplicate_epochs(events);
            update_minmax(target);

            if target.meta.dirtymark.is_zero() || target.meta.dirtymark != src.meta.dirtymark {
               target.meta.dirtymark = src.meta.dirtymark;
            }
            update_producers(&mut target.meta);
         });
      });

      self.write()
   }

   /// Merges one specific interval into another, for manual control
   /// and tests. `aggregate` is the production path.
   pub fn aggregate_interval(
      &self,
      source_interval: Interval,
      target_interval: Interval,
   ) -> Result<()> {
      let source = self.sparse_clone(source_interval);
      source.read()?;

      let target = self.sparse_clone(target_interval);
      target.merge_from(&source)?;

      if let Some(head) = target.with_state(|s| s.recent.first().map(|e| e.epoch)) {
         source.with_state_mut(|s| {
            s.meta.merged = Some(Merged { epoch: head, into_interval: Some(target_interval) });
         });
      }

      source.lock()?;
      let written = source.write();
      let unlock = source.unlock();
      written?;
      unlock
   }
}

/// Resolves epoch collisions after a bulk merge by nudging later
/// duplicates one tick at a time, then restores descending order.
pub fn deduplicate_epochs(events: Vec<Event>) -> Vec<Event> {
   if events.len() <= 1 {
      return events;
   }

   let mut result = events;
   let mut seen: HashSet<u64> = HashSet::with_capacity(result.len());
   for event in &mut result {
      let mut epoch = event.epoch;
      while !seen.insert(epoch.to_bits()) {
         epoch = epoch.increase_a_bit();
      }
      event.epoch = epoch;
   }
   sort_events_desc(&mut result);
   result
}

fn should_merge_by_age(target: &Recentfile, prev_interval: Interval) -> bool {
   match fs::metadata(target.rfile()) {
      Ok(meta) => {
         let age = meta
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or_default();
         age.as_secs() > prev_interval.secs()
      },
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
      Err(_) => false,
   }
}

#[cfg(test)]
mod tests {
   use tempfile::TempDir;

   use crate::recentfile::EventType;

   use super::*;

   fn event(epoch: f64, path: &str) -> Event {
      Event {
         epoch: Epoch::from_secs(epoch),
         path:  path.to_string(),
         kind:  EventType::New,
      }
   }

   #[test]
   fn dedup_bumps_colliding_epochs() {
      let events = vec![event(100.0, "a"), event(100.0, "b"), event(100.0, "c")];
      let deduped = deduplicate_epochs(events);

      assert_eq!(deduped.len(), 3);
      for pair in deduped.windows(2) {
         assert!(pair[0].epoch > pair[1].epoch);
      }
   }

   #[test]
   fn dedup_leaves_distinct_epochs_alone() {
      let events = vec![event(300.0, "a"), event(200.0, "b"), event(100.0, "c")];
      let deduped = deduplicate_epochs(events.clone());
      assert_eq!(deduped, events);
   }

   #[test]
   fn merging_into_smaller_interval_is_rejected() {
      let tmp = TempDir::new().unwrap();
      let hour = Recentfile::new(tmp.path(), "1h".parse().unwrap(), ".yaml").unwrap();
      let day = Recentfile::new(tmp.path(), "1d".parse().unwrap(), ".yaml").unwrap();

      let err = hour.merge_from(&day).unwrap_err();
      assert!(matches!(err, Error::Invariant(_)));
   }

   #[test]
   fn aggregate_without_aggregator_is_a_no_op() {
      let tmp = TempDir::new().unwrap();
      let rf = Recentfile::new(tmp.path(), "1h".parse().unwrap(), ".yaml").unwrap();
      rf.update("a.txt", EventType::New, None).unwrap();
      rf.aggregate(false).unwrap();
      assert!(!tmp.path().join("RECENT-6h.yaml").exists());
   }
}
