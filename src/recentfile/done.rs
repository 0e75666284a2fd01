//! Covered-interval bookkeeping.
//!
//! Clients consuming a RECENT file record which epoch ranges they have
//! already processed so a re-read skips them. The set is a list of
//! closed `[hi, lo]` intervals sorted descending by `hi`; no two
//! intervals overlap or touch.

use crate::epoch::Epoch;

use super::Event;

#[derive(Debug, Default, Clone)]
pub struct Done {
   intervals: Vec<(Epoch, Epoch)>,
}

impl Done {
   pub fn new() -> Self {
      Self::default()
   }

   /// True when some interval contains `epoch`.
   pub fn covered(&self, epoch: Epoch) -> bool {
      self
         .intervals
         .iter()
         .any(|&(hi, lo)| epoch <= hi && epoch >= lo)
   }

   /// True when a single interval contains both epochs.
   pub fn covered_pair(&self, e1: Epoch, e2: Epoch) -> bool {
      let (hi, lo) = if e1 >= e2 { (e1, e2) } else { (e2, e1) };
      self
         .intervals
         .iter()
         .any(|&(ivhi, ivlo)| hi <= ivhi && hi >= ivlo && lo <= ivhi && lo >= ivlo)
   }

   /// Marks events as processed. `indices` selects which events from
   /// the (descending) list to register; `None` registers all. An
   /// event adjacent to an already-covered neighbor extends that
   /// neighbor's interval outward; otherwise it starts a new singleton
   /// interval. Overlapping or touching intervals are consolidated.
   pub fn register(&mut self, events: &[Event], indices: Option<&[usize]>) {
      match indices {
         Some(indices) => {
            for &i in indices {
               self.register_one(events, i);
            }
         },
         None => {
            for i in 0..events.len() {
               self.register_one(events, i);
            }
         },
      }
   }

   fn register_one(&mut self, events: &[Event], i: usize) {
      let Some(event) = events.get(i) else {
         return;
      };
      let epoch = event.epoch;

      if self.covered(epoch) {
         return;
      }

      if self.intervals.is_empty() {
         self.intervals.push((epoch, epoch));
         return;
      }

      // Events are descending, so the left neighbor is newer (larger)
      // and the right neighbor older (smaller).
      let left = (i > 0).then(|| events[i - 1].epoch);
      let right = (i + 1 < events.len()).then(|| events[i + 1].epoch);

      let mut extended = false;
      for iv in &mut self.intervals {
         if let Some(left) = left
            && left <= iv.0
            && left >= iv.1
            && iv.1 >= epoch
         {
            iv.1 = epoch;
            extended = true;
         }
         if let Some(right) = right
            && right <= iv.0
            && right >= iv.1
            && iv.0 <= epoch
         {
            iv.0 = epoch;
            extended = true;
         }
      }

      if !extended {
         self.intervals.push((epoch, epoch));
      }
      self.consolidate();
   }

   /// Interval-merges another set into this one.
   pub fn merge(&mut self, other: &Done) {
      self.intervals.extend_from_slice(&other.intervals);
      self.consolidate();
   }

   /// Clears all coverage. Called when the dirtymark changes: a
   /// rewritten stream invalidates everything already processed.
   pub fn reset(&mut self) {
      self.intervals.clear();
   }

   pub fn intervals(&self) -> &[(Epoch, Epoch)] {
      &self.intervals
   }

   fn consolidate(&mut self) {
      self
         .intervals
         .sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

      let mut merged: Vec<(Epoch, Epoch)> = Vec::with_capacity(self.intervals.len());
      for (hi, lo) in self.intervals.drain(..) {
         match merged.last_mut() {
            // Previous interval reaches down to (or into) this one.
            Some(last) if last.1 <= hi => {
               last.0 = last.0.max(hi);
               last.1 = last.1.min(lo);
            },
            _ => merged.push((hi, lo)),
         }
      }
      self.intervals = merged;
   }
}
