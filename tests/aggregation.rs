mod support;

use mirrorlog::{
   epoch::Epoch,
   recentfile::{BatchItem, EventType, Recentfile},
};
use support::{age_file, assert_file_invariants, hierarchy, write_recentfile};
use tempfile::TempDir;

#[test]
fn single_add_flows_through_whole_chain() {
   let tmp = TempDir::new().expect("tempdir");
   let rec = hierarchy(tmp.path(), ".yaml", "1h", &["6h", "1d"]);
   rec.ensure_files_exist().expect("ensure");

   rec
      .batch_update(&[BatchItem::new("a.txt", EventType::New)])
      .expect("update");
   rec.aggregate(true).expect("aggregate");
   rec.load_all().expect("load");

   let mut epochs = Vec::new();
   for rf in rec.recentfiles() {
      let events = rf.events();
      assert_eq!(events.len(), 1, "{} should hold exactly one event", rf.interval());
      assert_eq!(events[0].path, "a.txt");
      assert_eq!(events[0].kind, EventType::New);
      epochs.push(events[0].epoch);
      assert_file_invariants(rf);
   }
   assert!(epochs.windows(2).all(|w| w[0] == w[1]), "same epoch at every level");
}

#[test]
fn first_merge_into_empty_target_retains_historical_events() {
   let tmp = TempDir::new().expect("tempdir");
   let now = Epoch::now();

   // Source carries one live and one ten-day-old event; the target
   // week file does not exist yet (no merged metadata, dirtymark 0).
   write_recentfile(
      tmp.path(),
      "1h",
      ".yaml",
      now,
      &[
         (now.as_secs(), "new.txt", EventType::New),
         (now.as_secs() - 10.0 * 86_400.0, "old.txt", EventType::New),
      ],
   );

   let source = Recentfile::new(tmp.path(), "1h".parse().unwrap(), ".yaml").expect("source");
   let target = source.sparse_clone("1W".parse().unwrap());
   target.merge_from(&source).expect("merge");

   let paths: Vec<String> = target.events().iter().map(|e| e.path.clone()).collect();
   assert_eq!(paths, ["new.txt", "old.txt"]);
   // The source's dirtymark is copied over after filtering.
   assert_eq!(target.meta().dirtymark, now);
}

#[test]
fn dirtymark_mismatch_preserves_events_regardless_of_age() {
   let tmp = TempDir::new().expect("tempdir");
   let now = Epoch::now();
   let ancient = now.as_secs() - 400.0 * 86_400.0;

   write_recentfile(
      tmp.path(),
      "1h",
      ".yaml",
      now,
      &[(now.as_secs(), "fresh.txt", EventType::New)],
   );
   // Target already has merge history under a different dirtymark.
   write_recentfile(
      tmp.path(),
      "6h",
      ".yaml",
      Epoch::from_secs(12345.0),
      &[(ancient, "ancient.txt", EventType::New)],
   );

   let source = Recentfile::new(tmp.path(), "1h".parse().unwrap(), ".yaml").expect("source");
   let target = source.sparse_clone("6h".parse().unwrap());
   target.merge_from(&source).expect("merge");

   let paths: Vec<String> = target.events().iter().map(|e| e.path.clone()).collect();
   assert!(paths.contains(&"fresh.txt".to_string()));
   assert!(
      paths.contains(&"ancient.txt".to_string()),
      "dirtymark mismatch keeps everything"
   );
}

#[test]
fn chain_progresses_when_previous_level_is_fresh() {
   let tmp = TempDir::new().expect("tempdir");
   let rec = hierarchy(tmp.path(), ".yaml", "1h", &["6h", "1d", "1W"]);
   rec.ensure_files_exist().expect("ensure");
   rec
      .batch_update(&[BatchItem::new("seed.txt", EventType::New)])
      .expect("seed");
   rec.aggregate(true).expect("populate chain");

   // 6h aged 2h (past the 1h source window), 1d and 1W aged 8h. The
   // 1W file merges because its age exceeds the *previous* source's
   // interval (6h), not 1d's.
   age_file(&tmp.path().join("RECENT-6h.yaml"), 2 * 3600);
   age_file(&tmp.path().join("RECENT-1d.yaml"), 8 * 3600);
   age_file(&tmp.path().join("RECENT-1W.yaml"), 8 * 3600);

   let week = tmp.path().join("RECENT-1W.yaml");
   let mtime_before = std::fs::metadata(&week).expect("stat").modified().expect("mtime");

   rec
      .batch_update(&[BatchItem::new("b.txt", EventType::New)])
      .expect("update");
   rec.aggregate(false).expect("aggregate");

   let mtime_after = std::fs::metadata(&week).expect("stat").modified().expect("mtime");
   assert!(mtime_after > mtime_before, "week file must be rewritten");

   rec.load_all().expect("load");
   let week_paths: Vec<String> = rec
      .by_interval("1W".parse().unwrap())
      .expect("1W")
      .events()
      .iter()
      .map(|e| e.path.clone())
      .collect();
   assert!(week_paths.contains(&"b.txt".to_string()));
}

#[test]
fn fresh_tail_stops_the_chain_without_skipping_levels() {
   let tmp = TempDir::new().expect("tempdir");
   let rec = hierarchy(tmp.path(), ".yaml", "1h", &["6h", "1d"]);
   rec.ensure_files_exist().expect("ensure");
   rec
      .batch_update(&[BatchItem::new("seed.txt", EventType::New)])
      .expect("seed");
   rec.aggregate(true).expect("populate");

   // Both targets just written: the 6h level always merges (step 0),
   // but 1d is fresh relative to the 1h window and stops the pass.
   let day = tmp.path().join("RECENT-1d.yaml");
   let mtime_before = std::fs::metadata(&day).expect("stat").modified().expect("mtime");

   std::thread::sleep(std::time::Duration::from_millis(50));
   rec
      .batch_update(&[BatchItem::new("later.txt", EventType::New)])
      .expect("update");
   rec.aggregate(false).expect("aggregate");

   let mtime_after = std::fs::metadata(&day).expect("stat").modified().expect("mtime");
   assert_eq!(mtime_before, mtime_after, "1d must not be rewritten yet");

   rec.load_all().expect("load");
   let six_paths: Vec<String> = rec
      .by_interval("6h".parse().unwrap())
      .expect("6h")
      .events()
      .iter()
      .map(|e| e.path.clone())
      .collect();
   assert!(six_paths.contains(&"later.txt".to_string()), "6h still merged");
}

#[test]
fn chain_propagation_carries_every_surviving_event_upward() {
   let tmp = TempDir::new().expect("tempdir");
   let rec = hierarchy(tmp.path(), ".yaml", "1h", &["6h", "1d"]);
   rec.ensure_files_exist().expect("ensure");

   let batch: Vec<BatchItem> = (0..20)
      .map(|i| BatchItem::new(format!("f{i:02}.txt"), EventType::New))
      .collect();
   rec.batch_update(&batch).expect("update");
   rec.aggregate(true).expect("aggregate");
   rec.load_all().expect("load");

   let files = rec.recentfiles();
   for pair in files.windows(2) {
      let (smaller, larger) = (&pair[0], &pair[1]);
      let larger_events: std::collections::HashMap<String, Epoch> = larger
         .events()
         .into_iter()
         .map(|e| (e.path, e.epoch))
         .collect();
      for event in smaller.events() {
         let upper = larger_events
            .get(&event.path)
            .unwrap_or_else(|| panic!("{} missing from {}", event.path, larger.interval()));
         assert!(*upper >= event.epoch);
      }
   }
}

#[test]
fn merged_pointer_tracks_target_head() {
   let tmp = TempDir::new().expect("tempdir");
   let rec = hierarchy(tmp.path(), ".yaml", "1h", &["6h"]);
   rec.ensure_files_exist().expect("ensure");
   rec
      .batch_update(&[BatchItem::new("a.txt", EventType::New)])
      .expect("update");
   rec.aggregate(true).expect("aggregate");
   rec.load_all().expect("load");

   let principal_meta = rec.principal().meta();
   let merged = principal_meta.merged.expect("merged pointer set");
   let six_head = rec
      .by_interval("6h".parse().unwrap())
      .expect("6h")
      .events()
      .first()
      .expect("6h head")
      .epoch;
   assert_eq!(merged.epoch, six_head);
   assert_eq!(merged.into_interval, Some("6h".parse().unwrap()));
}

#[test]
fn z_interval_keeps_delete_tombstones() {
   let tmp = TempDir::new().expect("tempdir");
   let rec = hierarchy(tmp.path(), ".yaml", "1h", &["Z"]);
   rec.ensure_files_exist().expect("ensure");

   rec
      .batch_update(&[
         BatchItem::new("kept.txt", EventType::New),
         BatchItem::new("gone.txt", EventType::Delete),
      ])
      .expect("update");
   rec.aggregate(true).expect("aggregate");
   rec.load_all().expect("load");

   let z_events = rec.by_interval("Z".parse().unwrap()).expect("Z").events();
   assert_eq!(z_events.len(), 2);
   assert!(z_events.iter().any(|e| e.kind == EventType::Delete));
}

#[test]
fn merge_order_does_not_change_the_result() {
   let now = Epoch::now();
   let dirtymark = Epoch::from_secs(now.as_secs() - 1000.0);
   let set_a: &[(f64, &str, EventType)] = &[
      (now.as_secs() - 10.0, "shared.txt", EventType::New),
      (now.as_secs() - 30.0, "only-a.txt", EventType::New),
   ];
   let set_b: &[(f64, &str, EventType)] = &[
      (now.as_secs() - 5.0, "shared.txt", EventType::Delete),
      (now.as_secs() - 20.0, "only-b.txt", EventType::New),
   ];

   let merge_both = |first: &[(f64, &str, EventType)], second: &[(f64, &str, EventType)]| {
      let tmp_first = TempDir::new().expect("tempdir");
      let tmp_second = TempDir::new().expect("tempdir");
      write_recentfile(tmp_first.path(), "1h", ".yaml", dirtymark, first);
      write_recentfile(tmp_second.path(), "1h", ".yaml", dirtymark, second);

      let src_first =
         Recentfile::new(tmp_first.path(), "1h".parse().unwrap(), ".yaml").expect("source");
      let src_second =
         Recentfile::new(tmp_second.path(), "1h".parse().unwrap(), ".yaml").expect("source");
      let target = src_first.sparse_clone("6h".parse().unwrap());
      target.merge_from(&src_first).expect("first merge");
      target.merge_from(&src_second).expect("second merge");
      target.events()
   };

   let ab = merge_both(set_a, set_b);
   let ba = merge_both(set_b, set_a);
   assert_eq!(ab, ba, "merge must be order-independent");

   let shared = ab.iter().find(|e| e.path == "shared.txt").expect("shared");
   assert_eq!(shared.kind, EventType::Delete, "newer event wins");
}

#[test]
fn aggregate_interval_merges_two_specific_levels() {
   let tmp = TempDir::new().expect("tempdir");
   let rec = hierarchy(tmp.path(), ".yaml", "1h", &["6h", "1d"]);
   rec.ensure_files_exist().expect("ensure");
   rec
      .batch_update(&[BatchItem::new("direct.txt", EventType::New)])
      .expect("update");

   rec
      .principal()
      .aggregate_interval("1h".parse().unwrap(), "1d".parse().unwrap())
      .expect("direct merge");

   let day = Recentfile::from_file(&tmp.path().join("RECENT-1d.yaml")).expect("read 1d");
   assert_eq!(day.events().len(), 1);
   assert_eq!(day.events()[0].path, "direct.txt");
}
