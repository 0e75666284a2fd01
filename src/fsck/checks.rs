//! The five fsck checks.

use std::{
   collections::{HashMap, HashSet},
   fs,
};

use walkdir::WalkDir;

use crate::{
   Result,
   collection::Recent,
   recentfile::{self, Event, EventType, serializer},
};

use super::Options;

/// Streaming batch size when scanning event files.
const STREAM_BATCH: usize = 10_000;
/// Files larger than this draw a warning in the integrity check.
const LARGE_FILE_BYTES: u64 = 100 * 1024 * 1024;
/// Paths statted by the index→disk check in non-verbose runs.
const SAMPLE_LIMIT: usize = 1000;
/// Individual findings logged before switching to counts only.
const SHOW_LIMIT: usize = 10;

/// Check 1: the aggregator hierarchy is structurally sound.
pub(super) fn check_hierarchy(rec: &Recent, opts: &Options) -> usize {
   let issues = rec.validate();
   for issue in &issues {
      tracing::warn!("hierarchy validation error: {issue}");
   }
   if issues.is_empty() && opts.verbose {
      tracing::debug!("hierarchy is valid");
   }
   issues.len()
}

/// Check 2: every recentfile exists, is statable, and parses. Empty
/// and oversized files are warned about but not counted.
pub(super) fn check_file_integrity(rec: &Recent, opts: &Options) -> usize {
   let mut issues = 0;

   for rf in rec.recentfiles() {
      let rfile = rf.rfile();

      let meta = match fs::metadata(&rfile) {
         Ok(meta) => meta,
         Err(e) => {
            if e.kind() == std::io::ErrorKind::NotFound {
               tracing::warn!("missing file: {}", rfile.display());
            } else {
               tracing::warn!("cannot stat {}: {e}", rfile.display());
            }
            issues += 1;
            continue;
         },
      };

      if meta.len() == 0 {
         // Might be intentional; readable but carries nothing.
         tracing::warn!("empty file: {}", rfile.display());
         continue;
      }
      if meta.len() > LARGE_FILE_BYTES {
         tracing::warn!(size = meta.len(), "large file: {}", rfile.display());
      }

      if opts.skip_events {
         if let Err(e) = fs::File::open(&rfile) {
            tracing::warn!("cannot read {}: {e}", rfile.display());
            issues += 1;
         }
         continue;
      }

      match serializer::validate_file(&rfile) {
         Ok(stats) => {
            if opts.verbose {
               tracing::debug!(
                  size = stats.file_size,
                  events = stats.event_count,
                  "file ok: {}",
                  rfile.display()
               );
            }
         },
         Err(e) => {
            tracing::warn!("cannot parse {}: {e}", rfile.display());
            issues += 1;
         },
      }
   }

   issues
}

/// Check 3: directory entries shaped like RECENT files that are not
/// registered in the hierarchy.
pub(super) fn check_orphaned_files(rec: &Recent, opts: &Options) -> usize {
   let expected: HashSet<String> = rec.recentfiles().iter().map(|rf| rf.rfilename()).collect();
   let filename_root = rec.principal().filename_root().to_string();

   let entries = match fs::read_dir(rec.local_root()) {
      Ok(entries) => entries,
      Err(e) => {
         tracing::warn!("cannot read {}: {e}", rec.local_root().display());
         return 1;
      },
   };

   let mut issues = 0;
   for entry in entries.filter_map(|e| e.ok()) {
      if entry.file_type().map(|t| t.is_dir()).unwrap_or(true) {
         continue;
      }
      let Some(name) = entry.file_name().to_str().map(str::to_string) else {
         continue;
      };

      let Ok((root, _, suffix)) = recentfile::split_rfilename(&name) else {
         continue;
      };
      if root != filename_root || !matches!(suffix.as_str(), ".yaml" | ".yml" | ".json") {
         continue;
      }

      if expected.contains(&name) {
         if opts.verbose {
            tracing::debug!("expected file: {name}");
         }
      } else {
         tracing::warn!("orphaned file not in hierarchy: {name}");
         issues += 1;
      }
   }

   issues
}

/// Check 4 (disk→index): every file on disk that is not transient and
/// not a root-level control file must be in the current index state.
pub(super) fn check_disk_matches_index(rec: &Recent, opts: &Options) -> usize {
   let index_paths = match build_index_state(rec) {
      Ok(paths) => paths,
      Err(e) => {
         tracing::warn!("cannot build index state: {e}");
         return 0;
      },
   };

   if opts.verbose {
      tracing::debug!(count = index_paths.len(), "loaded paths from index");
   }

   let mut issues = 0;
   let mut scanned = 0usize;
   let mut shown = 0usize;

   walk_tree(rec, |rel_path| {
      scanned += 1;
      if !index_paths.contains(rel_path) {
         issues += 1;
         if opts.verbose || shown < SHOW_LIMIT {
            tracing::warn!("file on disk but not in index: {rel_path}");
            shown += 1;
         }
      }
      if opts.verbose && scanned % 10_000 == 0 {
         tracing::debug!(scanned, not_in_index = issues, "scan progress");
      }
   });

   if issues > 0 {
      tracing::info!(count = issues, scanned, "files on disk but not in index");
   } else if opts.verbose {
      tracing::debug!(scanned, "all files on disk are in the index");
   }

   issues
}

/// Check 5 (index→disk): every path whose winning event is `new` must
/// exist on disk. Broken symlinks are informational, not issues.
pub(super) fn check_events_match_filesystem(rec: &Recent, opts: &Options) -> usize {
   let mut issues = 0;

   let state = match build_state_map(rec) {
      Ok(state) => state,
      Err(e) => {
         tracing::warn!("cannot stream event files: {e}");
         return 1;
      },
   };

   if opts.verbose {
      tracing::debug!(unique_paths = state.len(), "built state map");
   }

   let mut checked = 0usize;
   let mut missing = 0usize;
   let mut shown = 0usize;

   for (path, event) in &state {
      if event.kind == EventType::Delete {
         continue;
      }
      // Sample mode can miss localized corruption; verbose checks all.
      if !opts.verbose && checked >= SAMPLE_LIMIT {
         continue;
      }
      checked += 1;

      let full_path = rec.local_root().join(path);
      match fs::symlink_metadata(&full_path) {
         Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if opts.verbose || shown < SHOW_LIMIT {
               tracing::warn!("file in index but not on disk: {path}");
               shown += 1;
            }
            missing += 1;
            issues += 1;
         },
         Err(_) => {},
         Ok(_) => {
            // Entry exists; a failing stat behind it is a broken
            // symlink, which mirrored trees legitimately carry.
            if let Err(e) = fs::metadata(&full_path)
               && e.kind() == std::io::ErrorKind::NotFound
               && (opts.verbose || shown < SHOW_LIMIT)
            {
               tracing::warn!("broken symlink in index: {path}");
               shown += 1;
            }
         },
      }
   }

   if !opts.verbose && state.len() > SAMPLE_LIMIT {
      tracing::info!(checked, total_paths = state.len(), "checked sample of index paths");
   }
   if missing > 0 {
      tracing::info!(missing, checked, "files in index but not on disk");
   } else if opts.verbose {
      tracing::debug!(checked, "all indexed files exist on disk");
   }

   issues
}

/// Walks the local root, invoking `visit` with the slash-separated
/// relative path of every regular file that is neither transient nor a
/// root-level control file. Unreadable paths are skipped; directory
/// failures are reported but do not abort the scan.
pub(super) fn walk_tree(rec: &Recent, mut visit: impl FnMut(&str)) {
   let principal = rec.principal();
   let control =
      match recentfile::control_file_regex(principal.filename_root(), principal.suffix()) {
         Ok(rx) => rx,
         Err(e) => {
            tracing::warn!("control file pattern: {e}");
            return;
         },
      };

   for entry in WalkDir::new(rec.local_root()).follow_links(false) {
      let entry = match entry {
         Ok(entry) => entry,
         Err(e) => {
            tracing::warn!("walk error: {e}");
            continue;
         },
      };
      if entry.file_type().is_dir() {
         continue;
      }

      let Ok(rel) = entry.path().strip_prefix(rec.local_root()) else {
         continue;
      };
      let Some(rel) = rel.to_str() else {
         continue;
      };
      let rel = rel.replace('\\', "/");

      let basename = entry.file_name().to_string_lossy();
      if recentfile::should_ignore_file(&basename) {
         continue;
      }
      // Anchored at the root: control files inside subdirectories are
      // mirrored content and stay visible.
      if control.is_match(&rel) {
         continue;
      }

      visit(&rel);
   }
}

/// The winning (largest-epoch) event per path across all interval
/// files.
pub(super) fn build_state_map(rec: &Recent) -> Result<HashMap<String, Event>> {
   let mut state: HashMap<String, Event> = HashMap::new();

   for rf in rec.recentfiles() {
      if !rf.rfile().exists() {
         continue;
      }
      rf.stream_events(STREAM_BATCH, |events| {
         for event in events {
            let newer = match state.get(&event.path) {
               Some(existing) => event.epoch > existing.epoch,
               None => true,
            };
            if newer {
               state.insert(event.path.clone(), event.clone());
            }
         }
         true
      })?;
   }

   Ok(state)
}

/// The set of paths that semantically exist: winning event is `new`.
pub(super) fn build_index_state(rec: &Recent) -> Result<HashSet<String>> {
   let state = build_state_map(rec)?;
   Ok(state
      .into_iter()
      .filter(|(_, event)| event.kind == EventType::New)
      .map(|(path, _)| path)
      .collect())
}

/// Shared helper for repair: the relative paths of all regular files
/// currently on disk.
pub(super) fn disk_paths(rec: &Recent) -> HashSet<String> {
   let mut paths = HashSet::new();
   walk_tree(rec, |rel| {
      paths.insert(rel.to_string());
   });
   paths
}
