#![allow(dead_code)]

use std::path::{Path, PathBuf};

use mirrorlog::{
   collection::Recent,
   epoch::Epoch,
   interval::Interval,
   recentfile::{
      Event, EventType, Meta, PROTOCOL_VERSION, Recentfile,
      serializer::{self, Format},
   },
};

pub fn intervals(tokens: &[&str]) -> Vec<Interval> {
   tokens.iter().map(|t| t.parse().expect("interval")).collect()
}

/// A collection rooted at `root` with the given principal interval and
/// aggregator list. The root is canonicalized so watcher paths match.
pub fn hierarchy(root: &Path, suffix: &str, principal: &str, aggregator: &[&str]) -> Recent {
   let root = root.canonicalize().expect("canonicalize root");
   let principal = Recentfile::new(root, principal.parse().expect("interval"), suffix)
      .expect("recentfile")
      .with_aggregator(intervals(aggregator));
   Recent::with_principal(principal).expect("collection")
}

/// Hand-writes a RECENT file with full control over metadata and
/// events, bypassing update-time epoch assignment and truncation.
pub fn write_recentfile(
   root: &Path,
   interval: &str,
   suffix: &str,
   dirtymark: Epoch,
   events: &[(f64, &str, EventType)],
) -> PathBuf {
   let interval: Interval = interval.parse().expect("interval");
   let mut recent: Vec<Event> = events
      .iter()
      .map(|(epoch, path, kind)| Event {
         epoch: Epoch::from_secs(*epoch),
         path:  (*path).to_string(),
         kind:  *kind,
      })
      .collect();
   recent.sort_by(|a, b| b.epoch.partial_cmp(&a.epoch).expect("ordered epochs"));

   let meta = Meta {
      aggregator: Vec::new(),
      dirtymark,
      filenameroot: "RECENT".to_string(),
      interval,
      merged: None,
      minmax: None,
      protocol: PROTOCOL_VERSION,
      serializer_suffix: suffix.to_string(),
      producers: Default::default(),
   };

   let format = Format::from_suffix(suffix).expect("format");
   let bytes = serializer::marshal(format, &meta, &recent).expect("marshal");
   let path = root.join(format!("RECENT-{interval}{suffix}"));
   serializer::atomic_write(&path, &bytes).expect("write");
   path
}

/// Asserts the universal RECENT file invariants: strictly descending
/// unique epochs, unique paths, quantized epochs.
pub fn assert_file_invariants(rf: &Recentfile) {
   let events = rf.events();
   for pair in events.windows(2) {
      assert!(
         pair[0].epoch > pair[1].epoch,
         "epochs not strictly descending: {} then {}",
         pair[0].epoch,
         pair[1].epoch
      );
   }

   let mut paths = std::collections::HashSet::new();
   for event in &events {
      assert!(paths.insert(event.path.clone()), "duplicate path {}", event.path);
      assert!(
         event.epoch.is_quantized(),
         "epoch {} not quantized to 10us",
         event.epoch
      );
   }

   if let Some(minmax) = rf.meta().minmax {
      assert_eq!(minmax.max, events.first().expect("events").epoch);
      assert_eq!(minmax.min, events.last().expect("events").epoch);
   }
}

/// Ages a file's mtime by `secs` seconds.
pub fn age_file(path: &Path, secs: u64) {
   let mtime = std::time::SystemTime::now() - std::time::Duration::from_secs(secs);
   let file = std::fs::File::options()
      .write(true)
      .open(path)
      .expect("open for mtime");
   file.set_modified(mtime).expect("set mtime");
}

/// Polls until `check` passes or the timeout elapses.
pub fn wait_for(timeout: std::time::Duration, mut check: impl FnMut() -> bool) -> bool {
   let deadline = std::time::Instant::now() + timeout;
   while std::time::Instant::now() < deadline {
      if check() {
         return true;
      }
      std::thread::sleep(std::time::Duration::from_millis(25));
   }
   false
}
