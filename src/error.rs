use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Main error type for the mirrorlog crate.
///
/// Covers I/O failures, on-disk format problems, lock contention, and
/// invariant violations detected while manipulating RECENT files.
#[derive(Debug, Error)]
pub enum Error {
   /// I/O error occurred during file or directory operations.
   #[error("io error: {0}")]
   Io(#[from] io::Error),

   /// JSON serialization or deserialization error occurred.
   #[error("json error: {0}")]
   Json(#[from] serde_json::Error),

   /// YAML serialization or deserialization error occurred.
   #[error("yaml error: {0}")]
   Yaml(#[from] serde_yaml::Error),

   /// Filesystem notification backend error occurred.
   #[error("notify error: {0}")]
   Notify(#[from] notify::Error),

   /// Regex compilation error occurred.
   #[error("regex error: {0}")]
   Regex(#[from] regex::Error),

   /// A serializer suffix that no serializer handles.
   #[error("unsupported serializer suffix: {0}")]
   UnsupportedSuffix(String),

   /// A filename that does not parse as `<root>-<interval><suffix>`.
   #[error("invalid recentfile name: {0}")]
   InvalidFilename(String),

   /// An interval token that does not parse (`\d*[smhdWMQY]` or `Z`).
   #[error("invalid interval: {0}")]
   InvalidInterval(String),

   /// A file whose contents could not be interpreted.
   #[error("parse {path}: {reason}", path = path.display())]
   Format { path: PathBuf, reason: String },

   /// Lock acquisition gave up after the configured timeout.
   #[error("lock timeout after {elapsed:?}: {path}", path = path.display())]
   LockTimeout { path: PathBuf, elapsed: Duration },

   /// Lock state misuse (double lock, unlock without lock).
   #[error("lock state error on {path}: {reason}", path = path.display())]
   LockState { path: PathBuf, reason: &'static str },

   /// A caller broke an API contract, e.g. merging into a smaller
   /// interval.
   #[error("invariant violation: {0}")]
   Invariant(String),

   /// Contextual wrapper naming the failed operation and file.
   #[error("{op} {path}: {source}", path = path.display())]
   Context {
      op:     &'static str,
      path:   PathBuf,
      #[source]
      source: Box<Error>,
   },

   /// The watcher's event channel was full and an event was dropped.
   /// Not fatal; fsck repairs the gap.
   #[error("event channel full, dropped {path}")]
   ChannelFull { path: String },

   /// A background task died before reporting a result.
   #[error("background task failed: {0}")]
   TaskFailed(String),

   /// Fsck found issues and repair was not requested (or failed).
   #[error("fsck found {issues} issue(s); run with --repair to fix")]
   FsckIssues { issues: usize },
}

impl Error {
   /// Wraps an error with the operation and path it occurred on.
   pub fn context(self, op: &'static str, path: impl Into<PathBuf>) -> Self {
      Error::Context { op, path: path.into(), source: Box::new(self) }
   }

   /// True when the underlying cause is a missing file.
   pub fn is_not_found(&self) -> bool {
      match self {
         Error::Io(e) => e.kind() == io::ErrorKind::NotFound,
         Error::Context { source, .. } => source.is_not_found(),
         _ => false,
      }
   }
}

/// Standard result type using [`enum@Error`] as the default error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
