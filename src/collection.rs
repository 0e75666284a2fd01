//! The set of RECENT files covering one mirrored tree.
//!
//! A [`Recent`] collection orders the interval hierarchy derived from
//! the principal's aggregator list: the principal (smallest interval)
//! absorbs live updates, larger intervals are populated by aggregation.

use std::{
   collections::BTreeMap,
   fs,
   path::{Path, PathBuf},
   sync::Arc,
};

use crate::{
   Result,
   error::Error,
   interval::Interval,
   recentfile::{BatchItem, Recentfile},
};

/// An ordered collection of recentfiles sharing one local root.
pub struct Recent {
   files:      Vec<Arc<Recentfile>>,
   principal:  Arc<Recentfile>,
   local_root: PathBuf,
}

/// Statistics for one interval file.
#[derive(Debug, Clone, Default)]
pub struct FileStats {
   pub events: usize,
   pub size:   u64,
   pub mtime:  i64,
}

/// Statistics for a whole collection.
#[derive(Debug, Clone, Default)]
pub struct Stats {
   pub intervals:    usize,
   pub total_events: usize,
   pub files:        BTreeMap<String, FileStats>,
}

impl Recent {
   /// Loads a collection from the principal's file path (a concrete
   /// `RECENT-<interval><suffix>` name or a `<root>.recent` pointer).
   pub fn open(principal_path: &Path) -> Result<Self> {
      let principal = Recentfile::from_file(principal_path)
         .map_err(|e| e.context("load principal", principal_path))?;
      Self::with_principal(principal)
   }

   /// Builds a collection around an in-memory principal, materializing
   /// a lightweight clone for each aggregator interval.
   pub fn with_principal(principal: Recentfile) -> Result<Self> {
      let principal = Arc::new(principal);
      let local_root = principal.local_root().to_path_buf();

      let mut files: Vec<Arc<Recentfile>> = vec![Arc::clone(&principal)];
      for interval in principal.meta().aggregator {
         if interval == principal.interval() {
            continue;
         }
         files.push(Arc::new(principal.sparse_clone(interval)));
      }
      files.sort_by_key(|rf| rf.interval());
      files.dedup_by_key(|rf| rf.interval());

      Ok(Self { files, principal, local_root })
   }

   pub fn principal(&self) -> &Arc<Recentfile> {
      &self.principal
   }

   /// All members ordered by increasing interval.
   pub fn recentfiles(&self) -> &[Arc<Recentfile>] {
      &self.files
   }

   pub fn by_interval(&self, interval: Interval) -> Option<&Arc<Recentfile>> {
      self.files.iter().find(|rf| rf.interval() == interval)
   }

   pub fn local_root(&self) -> &Path {
      &self.local_root
   }

   pub fn intervals(&self) -> Vec<Interval> {
      self.files.iter().map(|rf| rf.interval()).collect()
   }

   /// Applies a batch of events to the principal.
   pub fn batch_update(&self, batch: &[BatchItem]) -> Result<()> {
      self.principal.batch_update(batch)
   }

   /// Runs one aggregation pass from the principal up the hierarchy.
   pub fn aggregate(&self, force: bool) -> Result<()> {
      self.principal.aggregate(force)
   }

   /// Creates any missing files on disk as empty (metadata-only)
   /// documents, under the file lock.
   pub fn ensure_files_exist(&self) -> Result<()> {
      for rf in &self.files {
         if rf.rfile().exists() {
            continue;
         }
         tracing::debug!("creating {}", rf.rfile().display());
         rf.lock()?;
         let written = rf.write();
         let unlock = rf.unlock();
         written?;
         unlock?;
      }
      Ok(())
   }

   /// Re-reads every member that exists on disk.
   pub fn load_all(&self) -> Result<()> {
      for rf in &self.files {
         match rf.read() {
            Ok(()) => {},
            Err(e) if e.is_not_found() => {},
            Err(e) => return Err(e),
         }
      }
      Ok(())
   }

   /// Per-interval and total statistics.
   pub fn stats(&self) -> Stats {
      let mut stats = Stats { intervals: self.files.len(), ..Stats::default() };
      for rf in &self.files {
         let mut fs_stats = FileStats { events: rf.event_count(), ..FileStats::default() };
         if let Ok(meta) = fs::metadata(rf.rfile()) {
            fs_stats.size = meta.len();
            fs_stats.mtime = meta
               .modified()
               .ok()
               .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
               .map_or(0, |d| d.as_secs() as i64);
         }
         stats.total_events += fs_stats.events;
         stats.files.insert(rf.interval().to_string(), fs_stats);
      }
      stats
   }

   /// Reports structural problems: duplicate or unsorted intervals,
   /// members rooted elsewhere, diverging aggregator lists.
   pub fn validate(&self) -> Vec<Error> {
      let mut issues = Vec::new();

      for pair in self.files.windows(2) {
         let (prev, curr) = (&pair[0], &pair[1]);
         if curr.interval().secs() == prev.interval().secs() {
            issues.push(Error::Invariant(format!(
               "duplicate interval {} in hierarchy",
               curr.interval()
            )));
         } else if curr.interval().secs() < prev.interval().secs() {
            issues.push(Error::Invariant(format!(
               "intervals not sorted: {} before {}",
               prev.interval(),
               curr.interval()
            )));
         }
      }

      for rf in &self.files {
         if rf.local_root() != self.local_root {
            issues.push(Error::Invariant(format!(
               "recentfile {} has local root {}, expected {}",
               rf.interval(),
               rf.local_root().display(),
               self.local_root.display()
            )));
         }
      }

      let principal_aggregator = self.principal.meta().aggregator;
      for rf in &self.files {
         if rf.meta().aggregator != principal_aggregator {
            issues.push(Error::Invariant(format!(
               "recentfile {} has a diverging aggregator list",
               rf.interval()
            )));
         }
      }

      issues
   }
}
