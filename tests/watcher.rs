mod support;

use std::{
   fs,
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
   time::Duration,
};

use mirrorlog::{
   error::Error,
   recentfile::{EventType, FileLock, Recentfile},
   watcher::{Watcher, WatcherConfig},
};
use support::{assert_file_invariants, hierarchy, wait_for};
use tempfile::TempDir;

fn quick_config() -> WatcherConfig {
   WatcherConfig {
      batch_size: 100,
      batch_delay: Duration::from_millis(100),
      ..WatcherConfig::default()
   }
}

fn principal_has_path(root: &std::path::Path, path: &str, kind: EventType) -> bool {
   let Ok(rf) = Recentfile::from_file(&root.join("RECENT-1h.yaml")) else {
      return false;
   };
   rf.events().iter().any(|e| e.path == path && e.kind == kind)
}

#[tokio::test(flavor = "multi_thread")]
async fn created_file_reaches_every_interval() {
   let tmp = TempDir::new().expect("tempdir");
   let root = tmp.path().canonicalize().expect("canonical root");
   let rec = Arc::new(hierarchy(&root, ".yaml", "1h", &["6h", "1d"]));
   rec.ensure_files_exist().expect("ensure");

   let mut watcher = Watcher::new(Arc::clone(&rec), quick_config()).expect("watcher");
   watcher.start().expect("start");

   fs::write(root.join("a.txt"), "payload").expect("create");
   assert!(
      wait_for(Duration::from_secs(10), || principal_has_path(
         &root,
         "a.txt",
         EventType::New
      )),
      "watcher should record the new file"
   );

   watcher.stop().await;

   rec.load_all().expect("load");
   rec.aggregate(true).expect("aggregate");
   rec.load_all().expect("load");

   let mut epochs = Vec::new();
   for rf in rec.recentfiles() {
      let events = rf.events();
      let event = events
         .iter()
         .find(|e| e.path == "a.txt")
         .unwrap_or_else(|| panic!("a.txt missing from {}", rf.interval()));
      assert_eq!(event.kind, EventType::New);
      epochs.push(event.epoch);
   }
   assert!(epochs.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test(flavor = "multi_thread")]
async fn removed_file_records_a_delete() {
   let tmp = TempDir::new().expect("tempdir");
   let root = tmp.path().canonicalize().expect("canonical root");
   fs::write(root.join("doomed.txt"), "x").expect("seed");

   let rec = Arc::new(hierarchy(&root, ".yaml", "1h", &[]));
   rec.ensure_files_exist().expect("ensure");

   let mut watcher = Watcher::new(Arc::clone(&rec), quick_config()).expect("watcher");
   watcher.start().expect("start");

   fs::remove_file(root.join("doomed.txt")).expect("remove");
   assert!(
      wait_for(Duration::from_secs(10), || principal_has_path(
         &root,
         "doomed.txt",
         EventType::Delete
      )),
      "watcher should record the delete"
   );

   watcher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn files_in_new_subdirectories_are_seen() {
   let tmp = TempDir::new().expect("tempdir");
   let root = tmp.path().canonicalize().expect("canonical root");
   let rec = Arc::new(hierarchy(&root, ".yaml", "1h", &[]));
   rec.ensure_files_exist().expect("ensure");

   let mut watcher = Watcher::new(Arc::clone(&rec), quick_config()).expect("watcher");
   watcher.start().expect("start");

   fs::create_dir_all(root.join("fresh/deeper")).expect("mkdir");
   // Give the subscription a moment before dropping a file inside.
   tokio::time::sleep(Duration::from_millis(300)).await;
   fs::write(root.join("fresh/deeper/inner.txt"), "x").expect("create");

   assert!(
      wait_for(Duration::from_secs(10), || principal_has_path(
         &root,
         "fresh/deeper/inner.txt",
         EventType::New
      )),
      "watcher should subscribe new subtrees"
   );

   watcher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn own_control_files_are_ignored() {
   let tmp = TempDir::new().expect("tempdir");
   let root = tmp.path().canonicalize().expect("canonical root");
   let rec = Arc::new(hierarchy(&root, ".yaml", "1h", &[]));
   rec.ensure_files_exist().expect("ensure");

   let mut watcher = Watcher::new(Arc::clone(&rec), quick_config()).expect("watcher");
   watcher.start().expect("start");

   fs::write(root.join("real.txt"), "x").expect("create");
   assert!(wait_for(Duration::from_secs(10), || principal_has_path(
      &root,
      "real.txt",
      EventType::New
   )));

   // Let a few flush cycles pass; the principal's own writes must not
   // echo back into the log.
   tokio::time::sleep(Duration::from_millis(500)).await;
   watcher.stop().await;

   let rf = Recentfile::from_file(&root.join("RECENT-1h.yaml")).expect("read");
   for event in rf.events() {
      assert!(
         !event.path.starts_with("RECENT"),
         "control file leaked into the log: {}",
         event.path
      );
   }
   assert_file_invariants(&rf);
}

#[tokio::test(flavor = "multi_thread")]
async fn overflow_drops_events_but_keeps_the_log_consistent() {
   let tmp = TempDir::new().expect("tempdir");
   let root = tmp.path().canonicalize().expect("canonical root");
   let rec = Arc::new(hierarchy(&root, ".yaml", "1h", &[]));
   rec.ensure_files_exist().expect("ensure");

   let drops = Arc::new(AtomicUsize::new(0));
   let drop_counter = Arc::clone(&drops);
   let config = WatcherConfig {
      batch_size: 4,
      batch_delay: Duration::from_millis(50),
      channel_capacity: 8,
      error_handler: Some(Arc::new(move |e: &Error| {
         if matches!(e, Error::ChannelFull { .. }) {
            drop_counter.fetch_add(1, Ordering::SeqCst);
         }
      })),
      ..WatcherConfig::default()
   };

   let mut watcher = Watcher::new(Arc::clone(&rec), config).expect("watcher");
   watcher.start().expect("start");

   // Stall the flusher by holding the principal's file lock, then
   // outrun the 8-slot channel.
   let held = FileLock::acquire(&root.join("RECENT-1h.yaml"), Duration::from_secs(30))
      .expect("external lock");
   for i in 0..300 {
      fs::write(root.join(format!("burst{i:03}.txt")), "x").expect("create");
   }

   assert!(
      wait_for(Duration::from_secs(15), || drops.load(Ordering::SeqCst) > 0),
      "expected at least one dropped event"
   );

   held.release().expect("release");
   // Remaining queued events flush once the lock is free.
   wait_for(Duration::from_secs(10), || {
      principal_count(&root) > 0
   });
   watcher.stop().await;

   let rf = Recentfile::from_file(&root.join("RECENT-1h.yaml")).expect("read");
   let count = rf.events().len();
   assert!(count > 0, "surviving events must be recorded");
   assert!(count < 300, "some events must have been dropped");
   assert_file_invariants(&rf);
}

fn principal_count(root: &std::path::Path) -> usize {
   Recentfile::from_file(&root.join("RECENT-1h.yaml"))
      .map(|rf| rf.events().len())
      .unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_flushes_the_queued_batch() {
   let tmp = TempDir::new().expect("tempdir");
   let root = tmp.path().canonicalize().expect("canonical root");
   let rec = Arc::new(hierarchy(&root, ".yaml", "1h", &[]));
   rec.ensure_files_exist().expect("ensure");

   // A long delay and a large batch keep everything queued until stop.
   let config = WatcherConfig {
      batch_size: 100_000,
      batch_delay: Duration::from_secs(3600),
      ..WatcherConfig::default()
   };
   let mut watcher = Watcher::new(Arc::clone(&rec), config).expect("watcher");
   watcher.start().expect("start");

   fs::write(root.join("pending.txt"), "x").expect("create");
   assert!(
      wait_for(Duration::from_secs(10), || watcher.stats().batch_len > 0),
      "event should be sitting in the batch"
   );

   watcher.stop().await;

   assert!(
      principal_has_path(&root, "pending.txt", EventType::New),
      "final flush must write the queued batch"
   );
}

#[tokio::test(flavor = "multi_thread")]
async fn periodic_aggregation_runs_from_the_processor_task() {
   let tmp = TempDir::new().expect("tempdir");
   let root = tmp.path().canonicalize().expect("canonical root");
   let rec = Arc::new(hierarchy(&root, ".yaml", "1h", &["6h"]));
   rec.ensure_files_exist().expect("ensure");

   let agg_runs = Arc::new(AtomicUsize::new(0));
   let agg_counter = Arc::clone(&agg_runs);
   let config = WatcherConfig {
      batch_size: 100,
      batch_delay: Duration::from_millis(50),
      aggregate_interval: Some(Duration::from_millis(250)),
      aggregation_callback: Some(Arc::new(move |_| {
         agg_counter.fetch_add(1, Ordering::SeqCst);
      })),
      ..WatcherConfig::default()
   };

   let mut watcher = Watcher::new(Arc::clone(&rec), config).expect("watcher");
   watcher.start().expect("start");

   fs::write(root.join("agg.txt"), "x").expect("create");
   assert!(
      wait_for(Duration::from_secs(10), || agg_runs.load(Ordering::SeqCst) >= 2),
      "periodic aggregation should fire"
   );
   watcher.stop().await;

   let six = Recentfile::from_file(&root.join("RECENT-6h.yaml")).expect("read 6h");
   assert!(six.events().iter().any(|e| e.path == "agg.txt"));
}
