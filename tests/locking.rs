mod support;

use std::{
   fs,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   thread,
   time::{Duration, Instant},
};

use mirrorlog::recentfile::{FileLock, Recentfile};
use tempfile::TempDir;

#[test]
fn lock_is_exclusive_across_threads() {
   let tmp = TempDir::new().expect("tempdir");
   let rfile = tmp.path().join("RECENT-1h.yaml");

   let held = FileLock::acquire(&rfile, Duration::from_secs(5)).expect("first acquire");
   let released = Arc::new(AtomicBool::new(false));

   let contender_path = rfile.clone();
   let contender_released = Arc::clone(&released);
   let contender = thread::spawn(move || {
      let lock = FileLock::acquire(&contender_path, Duration::from_secs(10))
         .expect("second acquire after release");
      assert!(
         contender_released.load(Ordering::SeqCst),
         "acquired while the first holder was still alive"
      );
      lock.release().expect("release");
   });

   thread::sleep(Duration::from_millis(150));
   released.store(true, Ordering::SeqCst);
   held.release().expect("release");
   contender.join().expect("join");
}

#[cfg(unix)]
#[test]
fn stale_lock_is_reclaimed_within_one_backoff_cycle() {
   let tmp = TempDir::new().expect("tempdir");
   let rfile = tmp.path().join("RECENT-1h.yaml");
   let lock_dir = tmp.path().join("RECENT-1h.yaml.lock");
   fs::create_dir(&lock_dir).expect("mkdir");
   // Above the default Linux pid_max, so never alive.
   fs::write(lock_dir.join("process"), "4194999\n").expect("pid file");

   let start = Instant::now();
   let lock = FileLock::acquire(&rfile, Duration::from_secs(5)).expect("acquire");
   assert!(
      start.elapsed() < Duration::from_secs(1),
      "stale lock should be reclaimed without waiting out the backoff"
   );
   lock.release().expect("release");
}

#[test]
fn timeout_reports_elapsed_time() {
   let tmp = TempDir::new().expect("tempdir");
   let rfile = tmp.path().join("RECENT-1h.yaml");
   let _held = FileLock::acquire(&rfile, Duration::from_secs(5)).expect("acquire");

   let err = FileLock::acquire(&rfile, Duration::from_millis(80)).expect_err("timeout");
   let message = err.to_string();
   assert!(message.contains("lock timeout"), "unexpected error: {message}");
   assert!(message.contains("RECENT-1h.yaml"));
}

#[test]
fn concurrent_updates_serialize_through_the_file_lock() {
   let tmp = TempDir::new().expect("tempdir");
   let root = tmp.path().to_path_buf();

   let mut handles = Vec::new();
   for worker in 0..4 {
      let root = root.clone();
      handles.push(thread::spawn(move || {
         let rf =
            Recentfile::new(&root, "1h".parse().unwrap(), ".yaml").expect("recentfile");
         for i in 0..5 {
            rf.update(
               &format!("w{worker}-f{i}.txt"),
               mirrorlog::recentfile::EventType::New,
               None,
            )
            .expect("update");
         }
      }));
   }
   for handle in handles {
      handle.join().expect("join");
   }

   let rf = Recentfile::from_file(&root.join("RECENT-1h.yaml")).expect("read");
   assert_eq!(rf.events().len(), 20, "no update may be lost");
   support::assert_file_invariants(&rf);
}
