//! On-disk format for RECENT files.
//!
//! Both serializers carry the same schema: a root document with a
//! `meta` block and a `recent` event list. JSON files stream through a
//! cursor that decodes one event at a time, so multi-million-event
//! files never sit in memory whole; YAML has no incremental decoder and
//! is parsed in full before events are delivered in batches.

use std::{
   fs,
   io::{BufReader, Read},
   path::{Path, PathBuf},
};

use serde::{
   Deserialize, Serialize,
   de::{DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor},
};

use crate::{Result, error::Error};

use super::{Event, Meta, PROTOCOL_VERSION, Recentfile, State, split_rfilename};

/// The two wire formats, selected by a recentfile's serializer suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
   Yaml,
   Json,
}

impl Format {
   pub fn from_suffix(suffix: &str) -> Result<Format> {
      match suffix {
         ".yaml" | ".yml" => Ok(Format::Yaml),
         ".json" => Ok(Format::Json),
         other => Err(Error::UnsupportedSuffix(other.to_string())),
      }
   }

   pub fn suffix(self) -> &'static str {
      match self {
         Format::Yaml => ".yaml",
         Format::Json => ".json",
      }
   }
}

/// The root document as read from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
   pub meta:   Meta,
   #[serde(default)]
   pub recent: Vec<Event>,
}

#[derive(Serialize)]
struct DocumentRef<'a> {
   meta:   &'a Meta,
   recent: &'a [Event],
}

pub fn marshal(format: Format, meta: &Meta, recent: &[Event]) -> Result<Vec<u8>> {
   let doc = DocumentRef { meta, recent };
   match format {
      Format::Json => {
         let mut bytes = serde_json::to_vec_pretty(&doc)?;
         bytes.push(b'\n');
         Ok(bytes)
      },
      Format::Yaml => Ok(serde_yaml::to_string(&doc)?.into_bytes()),
   }
}

pub fn unmarshal(format: Format, data: &[u8]) -> Result<Document> {
   match format {
      Format::Json => Ok(serde_json::from_slice(data)?),
      Format::Yaml => Ok(serde_yaml::from_slice(data)?),
   }
}

/// Writes `bytes` to `<path>.new`, then renames onto `path`. The
/// parent directory is created as needed and fsynced afterwards so the
/// rename survives a crash.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
   if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).map_err(|e| Error::from(e).context("mkdir", parent))?;
   }

   let staging = staging_path(path);
   {
      let mut file =
         fs::File::create(&staging).map_err(|e| Error::from(e).context("create", &staging))?;
      use std::io::Write;
      file
         .write_all(bytes)
         .map_err(|e| Error::from(e).context("write", &staging))?;
      file
         .sync_all()
         .map_err(|e| Error::from(e).context("sync", &staging))?;
   }

   if let Err(e) = fs::rename(&staging, path) {
      let _ = fs::remove_file(&staging);
      return Err(Error::from(e).context("rename", path));
   }

   if let Some(parent) = path.parent() {
      fsync_dir(parent)?;
   }
   Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
   let mut name = path.as_os_str().to_os_string();
   name.push(".new");
   PathBuf::from(name)
}

fn fsync_dir(dir: &Path) -> Result<()> {
   let handle = fs::File::open(dir).map_err(|e| Error::from(e).context("open dir", dir))?;
   handle
      .sync_all()
      .map_err(|e| Error::from(e).context("fsync dir", dir))?;
   Ok(())
}

/// Detects the format of a RECENT file: resolve the symlink target
/// name first, otherwise sniff the first non-whitespace byte (`{`
/// means JSON, anything else YAML).
pub fn detect_format(path: &Path) -> Result<Format> {
   fs::symlink_metadata(path).map_err(|e| Error::from(e).context("stat", path))?;

   if let Ok(target) = fs::read_link(path)
      && let Some(name) = target.file_name().and_then(|n| n.to_str())
      && let Ok((_, _, suffix)) = split_rfilename(name)
      && let Ok(format) = Format::from_suffix(&suffix)
   {
      return Ok(format);
   }

   let data = fs::read(path).map_err(|e| Error::from(e).context("read", path))?;
   let first = data.iter().find(|b| !b" \t\r\n".contains(b));
   match first {
      Some(b'{') => Ok(Format::Json),
      _ => Ok(Format::Yaml),
   }
}

impl Recentfile {
   pub(crate) fn format(&self) -> Result<Format> {
      Format::from_suffix(self.suffix())
   }

   /// Reads and deserializes the whole file into memory.
   pub fn read(&self) -> Result<()> {
      let path = self.rfile();
      let data = fs::read(&path).map_err(|e| Error::from(e).context("read", &path))?;
      let doc = unmarshal(self.format()?, &data).map_err(|e| Error::Format {
         path,
         reason: e.to_string(),
      })?;
      let dirtymark_changed = self.with_state_mut(|state| {
         let changed =
            !state.meta.dirtymark.is_zero() && state.meta.dirtymark != doc.meta.dirtymark;
         state.meta = doc.meta;
         state.recent = doc.recent;
         changed
      });
      if dirtymark_changed {
         // The event stream was rewritten; nothing previously covered
         // can be trusted.
         self.with_done(|done| done.reset());
      }
      Ok(())
   }

   /// Serializes the current state and writes it atomically.
   pub fn write(&self) -> Result<()> {
      let format = self.format()?;
      let bytes = self.with_state_mut(|state| {
         // Identity fields always win over whatever a read pulled in.
         state.meta.filenameroot = self.filename_root().to_string();
         state.meta.interval = self.interval();
         state.meta.serializer_suffix = self.suffix().to_string();
         state.meta.protocol = PROTOCOL_VERSION;
         marshal(format, &state.meta, &state.recent)
      })?;
      atomic_write(&self.rfile(), &bytes)
   }

   /// Loads a recentfile from a concrete filename (`RECENT-1h.yaml`) or
   /// from the `<root>.recent` principal pointer with format
   /// auto-detection.
   pub fn from_file(path: &Path) -> Result<Recentfile> {
      let name = path
         .file_name()
         .and_then(|n| n.to_str())
         .ok_or_else(|| Error::InvalidFilename(path.display().to_string()))?;
      let local_root = path
         .parent()
         .map(Path::to_path_buf)
         .unwrap_or_else(|| PathBuf::from("."));

      if path.extension().is_some_and(|e| e == "recent") {
         let format = detect_format(path)?;
         let data = fs::read(path).map_err(|e| Error::from(e).context("read", path))?;
         let doc = unmarshal(format, &data).map_err(|e| Error::Format {
            path:   path.to_path_buf(),
            reason: e.to_string(),
         })?;
         Format::from_suffix(&doc.meta.serializer_suffix)?;
         return Ok(Recentfile::from_parts(
            local_root,
            doc.meta.filenameroot.clone(),
            doc.meta.interval,
            doc.meta.serializer_suffix.clone(),
            State { meta: doc.meta, recent: doc.recent },
         ));
      }

      let (root, interval, suffix) = split_rfilename(name)?;
      let format = Format::from_suffix(&suffix)?;
      let data = fs::read(path).map_err(|e| Error::from(e).context("read", path))?;
      let doc = unmarshal(format, &data).map_err(|e| Error::Format {
         path:   path.to_path_buf(),
         reason: e.to_string(),
      })?;
      Ok(Recentfile::from_parts(
         local_root,
         root,
         interval,
         suffix,
         State { meta: doc.meta, recent: doc.recent },
      ))
   }

   /// Streams this file's events without materializing them all; see
   /// [`stream_events`].
   pub fn stream_events<F>(&self, batch_size: usize, callback: F) -> Result<StreamStats>
   where
      F: FnMut(&[Event]) -> bool,
   {
      stream_events(&self.rfile(), batch_size, callback)
   }

   /// Creates or refreshes the `<root>.recent` pointer so clients can
   /// discover the principal. A symlink already naming the correct
   /// target is left untouched.
   pub fn assert_symlink(&self) -> Result<()> {
      let link = self
         .local_root()
         .join(format!("{}.recent", self.filename_root()));
      let target = self.rfilename();

      #[cfg(unix)]
      {
         if let Ok(existing) = fs::read_link(&link)
            && existing == Path::new(&target)
         {
            return Ok(());
         }

         let mut tmp_name = link.as_os_str().to_os_string();
         tmp_name.push(".tmp");
         let tmp = PathBuf::from(tmp_name);
         let _ = fs::remove_file(&tmp);
         std::os::unix::fs::symlink(&target, &tmp)
            .map_err(|e| Error::from(e).context("symlink", &tmp))?;
         if let Err(e) = fs::rename(&tmp, &link) {
            let _ = fs::remove_file(&tmp);
            return Err(Error::from(e).context("rename symlink", &link));
         }
         Ok(())
      }

      #[cfg(not(unix))]
      {
         // Symlinks need privileges on Windows; mirror the principal's
         // content into a regular file instead.
         fs::copy(self.rfile(), &link).map_err(|e| Error::from(e).context("copy", &link))?;
         Ok(())
      }
   }
}

/// Summary of a streaming pass over a RECENT file.
#[derive(Debug, Clone)]
pub struct StreamStats {
   pub meta:        Meta,
   pub event_count: usize,
   pub file_size:   u64,
}

/// Streams events from a RECENT file, invoking `callback` every
/// `batch_size` events. The callback returns `false` to stop receiving
/// further batches. A `batch_size` of 0 parses without delivering.
pub fn stream_events<F>(path: &Path, batch_size: usize, mut callback: F) -> Result<StreamStats>
where
   F: FnMut(&[Event]) -> bool,
{
   let name = path
      .file_name()
      .and_then(|n| n.to_str())
      .ok_or_else(|| Error::InvalidFilename(path.display().to_string()))?;

   let format = if path.extension().is_some_and(|e| e == "recent") {
      detect_format(path)?
   } else {
      let (_, _, suffix) = split_rfilename(name)?;
      Format::from_suffix(&suffix)?
   };

   let file = fs::File::open(path).map_err(|e| Error::from(e).context("open", path))?;
   let file_size = file
      .metadata()
      .map_err(|e| Error::from(e).context("stat", path))?
      .len();

   let mut sink = EventSink {
      batch: Vec::new(),
      batch_size,
      callback: &mut callback,
      event_count: 0,
      stopped: false,
   };

   let meta = match format {
      Format::Json => stream_json(BufReader::new(file), &mut sink).map_err(|e| Error::Format {
         path:   path.to_path_buf(),
         reason: e.to_string(),
      })?,
      Format::Yaml => stream_yaml(BufReader::new(file), &mut sink).map_err(|e| Error::Format {
         path:   path.to_path_buf(),
         reason: e.to_string(),
      })?,
   };

   sink.flush();
   Ok(StreamStats { meta, event_count: sink.event_count, file_size })
}

/// Parses a file's structure without retaining events, verifying it is
/// well formed end to end.
pub fn validate_file(path: &Path) -> Result<StreamStats> {
   stream_events(path, 0, |_| true)
}

struct EventSink<'f> {
   batch:       Vec<Event>,
   batch_size:  usize,
   callback:    &'f mut dyn FnMut(&[Event]) -> bool,
   event_count: usize,
   stopped:     bool,
}

impl EventSink<'_> {
   fn push(&mut self, event: Event) {
      self.event_count += 1;
      if self.stopped || self.batch_size == 0 {
         return;
      }
      self.batch.push(event);
      if self.batch.len() >= self.batch_size {
         self.flush();
      }
   }

   fn flush(&mut self) {
      if self.batch.is_empty() || self.stopped {
         self.batch.clear();
         return;
      }
      if !(self.callback)(&self.batch) {
         self.stopped = true;
      }
      self.batch.clear();
   }
}

fn stream_yaml<R: Read>(mut reader: R, sink: &mut EventSink<'_>) -> Result<Meta> {
   let mut data = Vec::new();
   reader.read_to_end(&mut data)?;
   let doc: Document = serde_yaml::from_slice(&data)?;
   for event in doc.recent {
      sink.push(event);
   }
   Ok(doc.meta)
}

fn stream_json<R: Read>(reader: R, sink: &mut EventSink<'_>) -> Result<Meta> {
   let mut de = serde_json::Deserializer::from_reader(reader);
   let mut meta: Option<Meta> = None;
   DocumentSeed { sink, meta: &mut meta }.deserialize(&mut de)?;
   de.end()?;
   meta.ok_or_else(|| Error::Invariant("document has no meta block".to_string()))
}

/// Decodes `{meta, recent}` while feeding `recent` elements one at a
/// time into the sink instead of materializing the array.
struct DocumentSeed<'a, 'f> {
   sink: &'a mut EventSink<'f>,
   meta: &'a mut Option<Meta>,
}

impl<'de> DeserializeSeed<'de> for DocumentSeed<'_, '_> {
   type Value = ();

   fn deserialize<D: serde::Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
      deserializer.deserialize_map(self)
   }
}

impl<'de> Visitor<'de> for DocumentSeed<'_, '_> {
   type Value = ();

   fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.write_str("a RECENT document")
   }

   fn visit_map<A: MapAccess<'de>>(mut self, mut map: A) -> Result<(), A::Error> {
      while let Some(key) = map.next_key::<String>()? {
         match key.as_str() {
            "meta" => *self.meta = Some(map.next_value()?),
            "recent" => map.next_value_seed(EventArraySeed { sink: &mut *self.sink })?,
            _ => {
               map.next_value::<IgnoredAny>()?;
            },
         }
      }
      Ok(())
   }
}

struct EventArraySeed<'a, 'f> {
   sink: &'a mut EventSink<'f>,
}

impl<'de> DeserializeSeed<'de> for EventArraySeed<'_, '_> {
   type Value = ();

   fn deserialize<D: serde::Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
      deserializer.deserialize_seq(self)
   }
}

impl<'de> Visitor<'de> for EventArraySeed<'_, '_> {
   type Value = ();

   fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.write_str("an event array")
   }

   fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
      while let Some(event) = seq.next_element::<Event>()? {
         self.sink.push(event);
      }
      Ok(())
   }

   fn visit_unit<E: serde::de::Error>(self) -> Result<(), E> {
      Ok(())
   }
}
