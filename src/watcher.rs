//! Filesystem-watch ingestion pipeline.
//!
//! Three cooperating tasks turn raw OS notifications into batched
//! principal updates: a reader thread drains the notification source
//! and classifies each event, a bounded channel carries classified
//! items, and a batch-processor task flushes accumulated items to the
//! principal when the batch fills or a delay timer fires. When the
//! channel is full, items are dropped and reported; ordering and
//! liveness win over completeness under overload, and fsck repairs the
//! gap.

use std::{
   fs,
   path::{Path, PathBuf},
   sync::{Arc, Weak, mpsc as std_mpsc},
   thread,
   time::{Duration, Instant},
};

use notify::{
   Event as RawEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher,
   event::{ModifyKind, RenameMode},
};
use parking_lot::Mutex;
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::{
   Result,
   collection::Recent,
   error::Error,
   recentfile::{self, BatchItem, EventType},
};

/// Safety bound on raw notifications drained per reader wake.
const MAX_DRAIN: usize = 100_000;

pub type ErrorHandler = dyn Fn(&Error) + Send + Sync;
pub type EventCallback = dyn Fn(EventType, usize) + Send + Sync;
pub type AggregationCallback = dyn Fn(Duration) + Send + Sync;

/// Tuning knobs and callbacks for a [`Watcher`].
#[derive(Clone)]
pub struct WatcherConfig {
   /// Flush the accumulated batch at this size.
   pub batch_size: usize,
   /// Flush the accumulated batch after this delay.
   pub batch_delay: Duration,
   /// Capacity of the classified-event channel; items past it drop.
   pub channel_capacity: usize,
   /// Run `aggregate(false)` on this cadence from the batch-processor
   /// task; `None` disables periodic aggregation.
   pub aggregate_interval: Option<Duration>,
   pub error_handler: Option<Arc<ErrorHandler>>,
   pub event_callback: Option<Arc<EventCallback>>,
   pub aggregation_callback: Option<Arc<AggregationCallback>>,
}

impl Default for WatcherConfig {
   fn default() -> Self {
      Self {
         batch_size: 1000,
         batch_delay: Duration::from_secs(1),
         channel_capacity: 100_000,
         aggregate_interval: None,
         error_handler: None,
         event_callback: None,
         aggregation_callback: None,
      }
   }
}

/// Point-in-time pipeline statistics.
#[derive(Debug, Clone)]
pub struct WatcherStats {
   pub queued_events:    usize,
   pub batch_len:        usize,
   pub since_last_flush: Duration,
}

/// Watches a tree and feeds change events into a [`Recent`] collection.
pub struct Watcher {
   inner:      Arc<Inner>,
   rx:         Option<mpsc::Receiver<BatchItem>>,
   fs_watcher: Option<Arc<Mutex<RecommendedWatcher>>>,
   reader:     Option<thread::JoinHandle<()>>,
   processor:  Option<tokio::task::JoinHandle<()>>,
   token:      CancellationToken,
}

struct Inner {
   rec:        Arc<Recent>,
   root:       PathBuf,
   control:    regex::Regex,
   config:     WatcherConfig,
   tx:         mpsc::Sender<BatchItem>,
   batch:      Mutex<Vec<BatchItem>>,
   last_flush: Mutex<Instant>,
}

impl Inner {
   fn report(&self, err: &Error) {
      match &self.config.error_handler {
         Some(handler) => handler(err),
         None => tracing::error!("watcher error: {err}"),
      }
   }

   fn stats(&self) -> WatcherStats {
      WatcherStats {
         queued_events:    self.tx.max_capacity() - self.tx.capacity(),
         batch_len:        self.batch.lock().len(),
         since_last_flush: self.last_flush.lock().elapsed(),
      }
   }
}

impl Watcher {
   pub fn new(rec: Arc<Recent>, config: WatcherConfig) -> Result<Self> {
      let principal = rec.principal();
      let control =
         recentfile::control_file_regex(principal.filename_root(), principal.suffix())?;
      let root = rec.local_root().to_path_buf();

      let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
      let inner = Arc::new(Inner {
         rec,
         root,
         control,
         config,
         tx,
         batch: Mutex::new(Vec::new()),
         last_flush: Mutex::new(Instant::now()),
      });

      Ok(Self {
         inner,
         rx: Some(rx),
         fs_watcher: None,
         reader: None,
         processor: None,
         token: CancellationToken::new(),
      })
   }

   /// Subscribes the tree and starts the reader and batch-processor
   /// tasks. Must run inside a tokio runtime.
   pub fn start(&mut self) -> Result<()> {
      if self.reader.is_some() || self.processor.is_some() {
         return Err(Error::Invariant("watcher already running".to_string()));
      }

      let (raw_tx, raw_rx) = std_mpsc::channel();
      let fs_watcher = notify::recommended_watcher(move |event| {
         let _ = raw_tx.send(event);
      })?;
      let fs_watcher = Arc::new(Mutex::new(fs_watcher));

      // The root itself must subscribe; per-directory failures below
      // it degrade to warnings.
      fs_watcher
         .lock()
         .watch(&self.inner.root, RecursiveMode::NonRecursive)?;
      subscribe_tree(&mut fs_watcher.lock(), &self.inner.root);

      let reader_inner = Arc::clone(&self.inner);
      let reader_watcher = Arc::downgrade(&fs_watcher);
      let reader = thread::Builder::new()
         .name("mirrorlog-reader".to_string())
         .spawn(move || reader_loop(reader_inner, reader_watcher, raw_rx))
         .map_err(Error::Io)?;

      let processor_inner = Arc::clone(&self.inner);
      let rx = self
         .rx
         .take()
         .ok_or_else(|| Error::Invariant("watcher already consumed".to_string()))?;
      let token = self.token.clone();
      let processor = tokio::spawn(processor_loop(processor_inner, rx, token));

      self.fs_watcher = Some(fs_watcher);
      self.reader = Some(reader);
      self.processor = Some(processor);
      Ok(())
   }

   /// Cooperative shutdown: cancel, close the notification source
   /// (waking the reader), wait for both tasks, then flush whatever was
   /// already batched. In-flight channel items are not drained.
   pub async fn stop(&mut self) {
      self.token.cancel();
      self.fs_watcher = None;

      if let Some(reader) = self.reader.take() {
         let _ = tokio::task::spawn_blocking(move || reader.join()).await;
      }
      if let Some(processor) = self.processor.take() {
         let _ = processor.await;
      }
   }

   pub fn is_running(&self) -> bool {
      self.processor.is_some()
   }

   pub fn stats(&self) -> WatcherStats {
      self.inner.stats()
   }

   /// A cheap handle for reading pipeline statistics from other tasks.
   pub fn monitor(&self) -> WatcherMonitor {
      WatcherMonitor { inner: Arc::clone(&self.inner) }
   }
}

#[derive(Clone)]
pub struct WatcherMonitor {
   inner: Arc<Inner>,
}

impl WatcherMonitor {
   pub fn stats(&self) -> WatcherStats {
      self.inner.stats()
   }
}

/// Watches every real directory in the subtree rooted at `root`,
/// including `root` itself. Following symlinks is prohibited: a
/// symlinked directory prunes the walk. Per-directory failures degrade
/// to warnings.
fn subscribe_tree(watcher: &mut RecommendedWatcher, root: &Path) {
   for entry in WalkDir::new(root)
      .follow_links(false)
      .into_iter()
      .filter_map(|e| e.ok())
   {
      if !entry.file_type().is_dir() {
         continue;
      }
      if let Err(e) = watcher.watch(entry.path(), RecursiveMode::NonRecursive) {
         tracing::warn!("failed to watch {}: {e}", entry.path().display());
      }
   }
}

fn reader_loop(
   inner: Arc<Inner>,
   watcher: Weak<Mutex<RecommendedWatcher>>,
   raw_rx: std_mpsc::Receiver<notify::Result<RawEvent>>,
) {
   // Blocks on the notification source; exits when the watcher is
   // dropped and the sender disconnects.
   while let Ok(first) = raw_rx.recv() {
      let mut events = vec![first];
      while events.len() < MAX_DRAIN {
         match raw_rx.try_recv() {
            Ok(event) => events.push(event),
            Err(_) => break,
         }
      }
      handle_events(&inner, &watcher, events);
   }
}

fn handle_events(
   inner: &Inner,
   watcher: &Weak<Mutex<RecommendedWatcher>>,
   events: Vec<notify::Result<RawEvent>>,
) {
   for event in events {
      let event = match event {
         Ok(event) => event,
         Err(e) => {
            inner.report(&Error::Notify(e));
            continue;
         },
      };

      for (path, action) in classify_event(&event) {
         let basename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
         if recentfile::should_ignore_file(&basename) || inner.control.is_match(&basename) {
            continue;
         }

         match action {
            Action::Drop => {},
            Action::Subscribe => {
               if let Some(watcher) = watcher.upgrade() {
                  subscribe_tree(&mut watcher.lock(), &path);
               }
            },
            Action::Emit(kind) => {
               let item = BatchItem::new(path.to_string_lossy().into_owned(), kind);
               if inner.tx.try_send(item).is_err() {
                  inner.report(&Error::ChannelFull {
                     path: path.to_string_lossy().into_owned(),
                  });
               }
            },
         }
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
   Drop,
   Subscribe,
   Emit(EventType),
}

/// Maps one raw notification onto per-path actions.
fn classify_event(event: &RawEvent) -> Vec<(PathBuf, Action)> {
   match &event.kind {
      // A renamed pair carries [from, to].
      EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
         vec![
            (event.paths[0].clone(), Action::Emit(EventType::Delete)),
            (event.paths[1].clone(), classify_appearance(&event.paths[1])),
         ]
      },
      kind => event
         .paths
         .iter()
         .map(|p| (p.clone(), classify_path(kind, p)))
         .collect(),
   }
}

fn classify_path(kind: &EventKind, path: &Path) -> Action {
   match kind {
      EventKind::Create(_) => classify_appearance(path),
      EventKind::Modify(ModifyKind::Name(RenameMode::To)) => classify_appearance(path),
      // The source of a rename is gone; we cannot stat it.
      EventKind::Modify(ModifyKind::Name(_)) => Action::Emit(EventType::Delete),
      EventKind::Modify(_) => match fs::metadata(path) {
         Ok(meta) if meta.is_dir() => Action::Drop,
         // Stat failure still emits: the path may already be replaced.
         _ => Action::Emit(EventType::New),
      },
      EventKind::Remove(_) => Action::Emit(EventType::Delete),
      _ => Action::Drop,
   }
}

/// A path that just appeared: directories get subscribed, everything
/// else (including paths that cannot be statted) is a new file.
fn classify_appearance(path: &Path) -> Action {
   match fs::metadata(path) {
      Ok(meta) if meta.is_dir() => Action::Subscribe,
      _ => Action::Emit(EventType::New),
   }
}

async fn processor_loop(
   inner: Arc<Inner>,
   mut rx: mpsc::Receiver<BatchItem>,
   token: CancellationToken,
) {
   let start_delay = tokio::time::Instant::now() + inner.config.batch_delay;
   let mut flush_tick = tokio::time::interval_at(start_delay, inner.config.batch_delay);
   flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

   let mut agg_tick = inner.config.aggregate_interval.map(|period| {
      let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
      tick
   });

   loop {
      tokio::select! {
         item = rx.recv() => match item {
            Some(item) => {
               let full = {
                  let mut batch = inner.batch.lock();
                  batch.push(item);
                  batch.len() >= inner.config.batch_size
               };
               if full {
                  flush_batch(&inner).await;
                  flush_tick.reset();
               }
            },
            None => break,
         },
         _ = flush_tick.tick() => {
            flush_batch(&inner).await;
         },
         _ = tick_or_never(agg_tick.as_mut()) => {
            run_aggregation(&inner).await;
         },
         _ = token.cancelled() => break,
      }
   }

   // One explicit final flush of the already-queued batch.
   flush_batch(&inner).await;
}

async fn tick_or_never(tick: Option<&mut tokio::time::Interval>) {
   match tick {
      Some(tick) => {
         tick.tick().await;
      },
      None => std::future::pending().await,
   }
}

async fn flush_batch(inner: &Arc<Inner>) {
   let batch = {
      let mut batch = inner.batch.lock();
      if batch.is_empty() {
         return;
      }
      std::mem::take(&mut *batch)
   };

   let deduped = dedupe_batch(batch);
   let mut new_count = 0usize;
   let mut delete_count = 0usize;
   for item in &deduped {
      match item.kind {
         EventType::New => new_count += 1,
         EventType::Delete => delete_count += 1,
      }
   }

   let rec = Arc::clone(&inner.rec);
   let outcome = tokio::task::spawn_blocking(move || rec.batch_update(&deduped)).await;
   match outcome {
      Ok(Ok(())) => {
         if let Some(callback) = &inner.config.event_callback {
            if new_count > 0 {
               callback(EventType::New, new_count);
            }
            if delete_count > 0 {
               callback(EventType::Delete, delete_count);
            }
         }
         *inner.last_flush.lock() = Instant::now();
      },
      Ok(Err(e)) => inner.report(&e),
      Err(join) => inner.report(&Error::TaskFailed(join.to_string())),
   }
}

async fn run_aggregation(inner: &Arc<Inner>) {
   let rec = Arc::clone(&inner.rec);
   let start = Instant::now();
   match tokio::task::spawn_blocking(move || rec.aggregate(false)).await {
      Ok(Ok(())) => {
         if let Some(callback) = &inner.config.aggregation_callback {
            callback(start.elapsed());
         }
      },
      Ok(Err(e)) => inner.report(&e),
      Err(join) => inner.report(&Error::TaskFailed(join.to_string())),
   }
}

/// Keeps the last-seen event per path, in deterministic path order.
fn dedupe_batch(batch: Vec<BatchItem>) -> Vec<BatchItem> {
   let mut by_path: std::collections::BTreeMap<String, BatchItem> =
      std::collections::BTreeMap::new();
   for item in batch {
      by_path.insert(item.path.clone(), item);
   }
   by_path.into_values().collect()
}
