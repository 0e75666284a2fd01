//! Single-interval RECENT log files.
//!
//! A [`Recentfile`] is one on-disk log of change events covering a time
//! window (`RECENT-1h.yaml`, `RECENT-6h.yaml`, ...). Events are kept
//! strictly descending by epoch, unique per path, and truncated to the
//! file's window on every update. Cross-process writers coordinate
//! through a directory-creation lock next to the file.

use std::{
   cmp::Ordering,
   collections::{BTreeMap, HashSet},
   fmt,
   path::{Path, PathBuf},
   time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
   Result,
   epoch::Epoch,
   error::Error,
   interval::Interval,
};

pub mod aggregate;
pub mod done;
pub mod lock;
pub mod serializer;

pub use aggregate::deduplicate_epochs;
pub use done::Done;
pub use lock::{FileLock, is_pid_alive};

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_FILENAME_ROOT: &str = "RECENT";
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(600);

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
   New,
   Delete,
}

impl EventType {
   pub fn as_str(self) -> &'static str {
      match self {
         EventType::New => "new",
         EventType::Delete => "delete",
      }
   }
}

impl fmt::Display for EventType {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

/// A single change event. `path` is slash-separated and relative to the
/// tree root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
   pub epoch: Epoch,
   pub path:  String,
   #[serde(rename = "type")]
   pub kind:  EventType,
}

/// One entry of a batch update. `epoch` is the optional dirty epoch for
/// backdated events.
#[derive(Debug, Clone)]
pub struct BatchItem {
   pub path:  String,
   pub kind:  EventType,
   pub epoch: Option<Epoch>,
}

impl BatchItem {
   pub fn new(path: impl Into<String>, kind: EventType) -> Self {
      Self { path: path.into(), kind, epoch: None }
   }
}

/// Last point this file was merged into a larger interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Merged {
   pub epoch: Epoch,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub into_interval: Option<Interval>,
}

/// Epoch range currently stored in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Minmax {
   pub max: Epoch,
   pub min: Epoch,
   #[serde(default, skip_serializing_if = "is_zero_i64")]
   pub mtime: i64,
}

fn is_zero_i64(v: &i64) -> bool {
   *v == 0
}

/// The `meta` block persisted at the head of every RECENT file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
   #[serde(default, skip_serializing_if = "Vec::is_empty")]
   pub aggregator: Vec<Interval>,
   #[serde(default, skip_serializing_if = "Epoch::is_zero")]
   pub dirtymark: Epoch,
   pub filenameroot: String,
   pub interval: Interval,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub merged: Option<Merged>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub minmax: Option<Minmax>,
   pub protocol: u32,
   pub serializer_suffix: String,
   // Uppercase key for compatibility with files written by other
   // producers of the format.
   #[serde(rename = "Producers", default, skip_serializing_if = "BTreeMap::is_empty")]
   pub producers: BTreeMap<String, serde_json::Value>,
}

pub(crate) struct State {
   pub meta:   Meta,
   pub recent: Vec<Event>,
}

/// A single RECENT file covering one time interval.
pub struct Recentfile {
   local_root:    PathBuf,
   filename_root: String,
   interval:      Interval,
   suffix:        String,
   lock_timeout:  Duration,
   state:         RwLock<State>,
   lock:          Mutex<Option<FileLock>>,
   done:          Mutex<Done>,
}

impl Recentfile {
   /// Creates an in-memory recentfile; nothing touches disk until the
   /// first write.
   pub fn new(local_root: impl Into<PathBuf>, interval: Interval, suffix: &str) -> Result<Self> {
      serializer::Format::from_suffix(suffix)?;
      let meta = Meta {
         aggregator: Vec::new(),
         dirtymark: Epoch::ZERO,
         filenameroot: DEFAULT_FILENAME_ROOT.to_string(),
         interval,
         merged: None,
         minmax: None,
         protocol: PROTOCOL_VERSION,
         serializer_suffix: suffix.to_string(),
         producers: BTreeMap::new(),
      };
      Ok(Self {
         local_root: local_root.into(),
         filename_root: DEFAULT_FILENAME_ROOT.to_string(),
         interval,
         suffix: suffix.to_string(),
         lock_timeout: DEFAULT_LOCK_TIMEOUT,
         state: RwLock::new(State { meta, recent: Vec::new() }),
         lock: Mutex::new(None),
         done: Mutex::new(Done::new()),
      })
   }

   pub fn with_aggregator(self, aggregator: Vec<Interval>) -> Self {
      self.state.write().meta.aggregator = aggregator;
      self
   }

   pub fn with_filename_root(mut self, root: impl Into<String>) -> Self {
      let root = root.into();
      self.state.write().meta.filenameroot = root.clone();
      self.filename_root = root;
      self
   }

   pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
      self.lock_timeout = timeout;
      self
   }

   pub(crate) fn from_parts(
      local_root: PathBuf,
      filename_root: String,
      interval: Interval,
      suffix: String,
      state: State,
   ) -> Self {
      Self {
         local_root,
         filename_root,
         interval,
         suffix,
         lock_timeout: DEFAULT_LOCK_TIMEOUT,
         state: RwLock::new(state),
         lock: Mutex::new(None),
         done: Mutex::new(Done::new()),
      }
   }

   pub fn interval(&self) -> Interval {
      self.interval
   }

   pub fn local_root(&self) -> &Path {
      &self.local_root
   }

   pub fn filename_root(&self) -> &str {
      &self.filename_root
   }

   pub fn suffix(&self) -> &str {
      &self.suffix
   }

   /// The filename, e.g. `RECENT-1h.yaml`.
   pub fn rfilename(&self) -> String {
      format!("{}-{}{}", self.filename_root, self.interval, self.suffix)
   }

   /// The full path of the file under the local root.
   pub fn rfile(&self) -> PathBuf {
      self.local_root.join(self.rfilename())
   }

   /// A copy of the current metadata.
   pub fn meta(&self) -> Meta {
      self.state.read().meta.clone()
   }

   /// A copy of the current events, descending by epoch.
   pub fn events(&self) -> Vec<Event> {
      self.state.read().recent.clone()
   }

   pub fn event_count(&self) -> usize {
      self.state.read().recent.len()
   }

   pub(crate) fn replace_events(&self, events: Vec<Event>) {
      let mut state = self.state.write();
      state.recent = events;
      update_minmax(&mut state);
   }

   /// Runs `f` with this file's covered-interval tracker.
   pub fn with_done<R>(&self, f: impl FnOnce(&mut Done) -> R) -> R {
      f(&mut self.done.lock())
   }

   pub(crate) fn with_state<R>(&self, f: impl FnOnce(&State) -> R) -> R {
      f(&self.state.read())
   }

   pub(crate) fn with_state_mut<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
      f(&mut self.state.write())
   }

   /// A clone carrying only configuration (no events, no stream
   /// metadata), re-targeted at another interval. Used to materialize
   /// the aggregator hierarchy from the principal.
   pub fn sparse_clone(&self, interval: Interval) -> Self {
      let state = self.state.read();
      let meta = Meta {
         aggregator: state.meta.aggregator.clone(),
         dirtymark: Epoch::ZERO,
         filenameroot: state.meta.filenameroot.clone(),
         interval,
         merged: None,
         minmax: None,
         protocol: state.meta.protocol,
         serializer_suffix: state.meta.serializer_suffix.clone(),
         producers: BTreeMap::new(),
      };
      Self {
         local_root: self.local_root.clone(),
         filename_root: self.filename_root.clone(),
         interval,
         suffix: self.suffix.clone(),
         lock_timeout: self.lock_timeout,
         state: RwLock::new(State { meta, recent: Vec::new() }),
         lock: Mutex::new(None),
         done: Mutex::new(Done::new()),
      }
   }

   /// Adds or updates a single event. See [`Recentfile::batch_update`].
   pub fn update(&self, path: &str, kind: EventType, dirty_epoch: Option<Epoch>) -> Result<()> {
      self.batch_update(&[BatchItem { path: path.to_string(), kind, epoch: dirty_epoch }])
   }

   /// Applies a batch of events in one lock-read-mutate-write cycle.
   ///
   /// Within the batch the sequence matters only for monotonic epoch
   /// assignment; the final state keeps the last-seen event per path.
   /// An empty batch is a no-op and does not touch the file.
   pub fn batch_update(&self, batch: &[BatchItem]) -> Result<()> {
      if batch.is_empty() {
         return Ok(());
      }

      self.lock()?;
      let result = self.batch_update_locked(batch);
      let unlock = self.unlock();
      result?;
      unlock
   }

   fn batch_update_locked(&self, batch: &[BatchItem]) -> Result<()> {
      match self.read() {
         Ok(()) => {},
         Err(e) if e.is_not_found() => {},
         Err(e) => return Err(e),
      }

      {
         let mut state = self.state.write();
         let now = Epoch::now();

         // Assign epochs in batch order so later items land above
         // earlier ones even within a single clock tick.
         let mut head = state.recent.first().map(|e| e.epoch);
         let mut processed: BTreeMap<String, Event> = BTreeMap::new();
         let mut backdated = false;
         for item in batch {
            let path = self.canonize_path(&item.path);
            let epoch = match item.epoch {
               Some(dirty) if !dirty.is_zero() && dirty < now => {
                  backdated = true;
                  ensure_monotonic(dirty, head)
               },
               _ => ensure_monotonic(now, head),
            };
            head = Some(epoch);
            processed.insert(path.clone(), Event { epoch, path, kind: item.kind });
         }

         if backdated {
            // A rewritten past invalidates everything consumers have
            // covered and anything already merged upward.
            state.meta.dirtymark = now;
            state.meta.merged = None;
         }

         {
            let touched: HashSet<&str> = processed.keys().map(String::as_str).collect();
            state.recent.retain(|e| !touched.contains(e.path.as_str()));
         }
         state.recent.extend(processed.into_values());
         sort_events_desc(&mut state.recent);

         let cutoff = self.truncate_cutoff(&state.meta, now);
         if let Some(cutoff) = cutoff {
            state.recent.retain(|e| e.epoch >= cutoff);
         }

         update_minmax(&mut state);
         update_producers(&mut state.meta);
      }

      self.write()?;

      if let Err(e) = self.assert_symlink() {
         tracing::warn!("assert symlink: {e}");
      }

      Ok(())
   }

   /// The retention cutoff for update-time truncation, or `None` when
   /// everything is retained.
   fn truncate_cutoff(&self, meta: &Meta, now: Epoch) -> Option<Epoch> {
      if let Some(merged) = &meta.merged
         && !merged.epoch.is_zero()
      {
         return Some(merged.epoch);
      }
      if self.interval.is_infinite() {
         return None;
      }
      Some(now.sub_secs(self.interval.secs() as f64))
   }

   /// Strips the local root, strips any leading slash, and normalizes
   /// the remainder.
   pub fn canonize_path(&self, path: &str) -> String {
      let root = self.local_root.to_string_lossy();
      let rel = path.strip_prefix(root.as_ref()).unwrap_or(path);
      let rel = rel.strip_prefix('/').unwrap_or(rel);
      naive_path_normalize(rel)
   }

   /// Acquires the cross-process lock for this file.
   pub fn lock(&self) -> Result<()> {
      if self.lock.lock().is_some() {
         return Err(Error::LockState { path: self.rfile(), reason: "already locked" });
      }
      let acquired = FileLock::acquire(&self.rfile(), self.lock_timeout)?;
      *self.lock.lock() = Some(acquired);
      Ok(())
   }

   /// Releases the cross-process lock. Unlocking an unlocked file is an
   /// error.
   pub fn unlock(&self) -> Result<()> {
      match self.lock.lock().take() {
         Some(held) => held.release(),
         None => Err(Error::LockState { path: self.rfile(), reason: "not locked" }),
      }
   }

   pub fn locked(&self) -> bool {
      self.lock.lock().is_some()
   }
}

/// Returns `increase_a_bit(head)` when `epoch` would not sort above the
/// current head, otherwise `epoch` unchanged.
pub(crate) fn ensure_monotonic(epoch: Epoch, head: Option<Epoch>) -> Epoch {
   match head {
      Some(head) if epoch <= head => head.increase_a_bit(),
      _ => epoch,
   }
}

/// Sorts descending by epoch. Incoming events land near the head, so
/// the slice is usually almost sorted, which std's adaptive sort turns
/// into a near-linear pass.
pub(crate) fn sort_events_desc(events: &mut [Event]) {
   events.sort_by(|a, b| b.epoch.partial_cmp(&a.epoch).unwrap_or(Ordering::Equal));
}

pub(crate) fn update_minmax(state: &mut State) {
   state.meta.minmax = match (state.recent.first(), state.recent.last()) {
      (Some(first), Some(last)) => Some(Minmax {
         max:   first.epoch,
         min:   last.epoch,
         mtime: unix_now(),
      }),
      _ => None,
   };
}

fn unix_now() -> i64 {
   SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs() as i64
}

pub(crate) fn update_producers(meta: &mut Meta) {
   let exe = std::env::current_exe()
      .map(|p| p.display().to_string())
      .unwrap_or_else(|_| std::env::args().next().unwrap_or_default());
   meta.producers = BTreeMap::from([
      ("$0".to_string(), serde_json::Value::String(exe)),
      (
         env!("CARGO_PKG_NAME").to_string(),
         serde_json::Value::String(env!("CARGO_PKG_VERSION").to_string()),
      ),
      ("time".to_string(), serde_json::json!(Epoch::now().as_secs())),
   ]);
}

/// Canonicalizes a slash-separated relative path: collapses repeated
/// slashes, resolves `.` and `..` segments, drops leading and trailing
/// slashes.
pub fn naive_path_normalize(path: &str) -> String {
   let mut segments: Vec<&str> = Vec::new();
   for segment in path.split('/') {
      match segment {
         "" | "." => {},
         ".." => {
            segments.pop();
         },
         other => segments.push(other),
      }
   }
   segments.join("/")
}

/// Parses `<root>-<interval><suffix>` into its components.
pub fn split_rfilename(name: &str) -> Result<(String, Interval, String)> {
   let dot = name
      .rfind('.')
      .ok_or_else(|| Error::InvalidFilename(name.to_string()))?;
   let (stem, suffix) = name.split_at(dot);
   let dash = stem
      .rfind('-')
      .ok_or_else(|| Error::InvalidFilename(name.to_string()))?;
   let root = &stem[..dash];
   let token = &stem[dash + 1..];
   if root.is_empty() || token.is_empty() {
      return Err(Error::InvalidFilename(name.to_string()));
   }
   let interval: Interval = token
      .parse()
      .map_err(|_| Error::InvalidFilename(name.to_string()))?;
   Ok((root.to_string(), interval, suffix.to_string()))
}

/// True for transient files that watchers and scans must skip.
pub fn should_ignore_file(basename: &str) -> bool {
   basename.starts_with(".FRMRecent") || basename.ends_with(".tmp")
}

/// The pattern matching every control file this crate manages at the
/// tree root: interval files, their `.lock` directories and `.new`
/// staging files, and the `<root>.recent` principal pointer.
pub fn control_file_regex(filename_root: &str, suffix: &str) -> Result<regex::Regex> {
   let pattern = format!(
      r"^{}(-[0-9]*[smhdWMQYZ]{}(\.lock(/.*)?|\.new)?|\.recent)$",
      regex::escape(filename_root),
      regex::escape(suffix),
   );
   Ok(regex::Regex::new(&pattern)?)
}
