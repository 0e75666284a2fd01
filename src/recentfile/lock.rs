//! Cross-process mutual exclusion for RECENT files.
//!
//! The lock is a directory (`<rfile>.lock/`) because `mkdir` is atomic
//! on POSIX and behaves on network filesystems where advisory flock
//! does not. The directory holds a `process` file with the owner's PID
//! so that locks abandoned by a crashed process can be reclaimed.

use std::{
   fs,
   path::{Path, PathBuf},
   thread,
   time::{Duration, Instant},
};

use crate::{Result, error::Error};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// An acquired directory lock. Dropping without [`FileLock::release`]
/// removes the directory on a best-effort basis.
#[derive(Debug)]
pub struct FileLock {
   dir:      PathBuf,
   released: bool,
}

impl FileLock {
   /// Acquires the lock for `rfile`, waiting up to `timeout` with
   /// exponential backoff while another live process holds it. Stale
   /// locks (missing, empty, or unparseable PID file, or a dead owner)
   /// are removed and retried immediately.
   pub fn acquire(rfile: &Path, timeout: Duration) -> Result<Self> {
      let dir = lock_dir(rfile);
      let start = Instant::now();
      let mut backoff = INITIAL_BACKOFF;

      loop {
         match fs::create_dir(&dir) {
            Ok(()) => {
               if let Err(e) = write_pid_file(&dir) {
                  let _ = fs::remove_dir_all(&dir);
                  return Err(Error::from(e).context("write lock pid", &dir));
               }
               return Ok(Self { dir, released: false });
            },
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {},
            Err(e) => return Err(Error::from(e).context("mkdir", &dir)),
         }

         if lock_is_stale(&dir) {
            fs::remove_dir_all(&dir)
               .or_else(ignore_not_found)
               .map_err(|e| Error::from(e).context("remove stale lock", &dir))?;
            continue;
         }

         if start.elapsed() > timeout {
            return Err(Error::LockTimeout { path: rfile.to_path_buf(), elapsed: start.elapsed() });
         }

         thread::sleep(backoff);
         backoff = (backoff * 2).min(MAX_BACKOFF);
      }
   }

   /// Releases the lock by removing the directory.
   pub fn release(mut self) -> Result<()> {
      self.released = true;
      fs::remove_dir_all(&self.dir).map_err(|e| Error::from(e).context("remove lock", &self.dir))
   }
}

impl Drop for FileLock {
   fn drop(&mut self) {
      if !self.released {
         let _ = fs::remove_dir_all(&self.dir);
      }
   }
}

fn lock_dir(rfile: &Path) -> PathBuf {
   let mut name = rfile.as_os_str().to_os_string();
   name.push(".lock");
   PathBuf::from(name)
}

fn write_pid_file(dir: &Path) -> std::io::Result<()> {
   let pid = std::process::id();
   fs::write(dir.join("process"), format!("{pid}\n"))
}

/// A lock is stale when its owner cannot be identified or is dead.
fn lock_is_stale(dir: &Path) -> bool {
   let Ok(raw) = fs::read_to_string(dir.join("process")) else {
      return true;
   };
   let Ok(pid) = raw.trim().parse::<u32>() else {
      return true;
   };
   !is_pid_alive(pid)
}

fn ignore_not_found(e: std::io::Error) -> std::io::Result<()> {
   if e.kind() == std::io::ErrorKind::NotFound {
      Ok(())
   } else {
      Err(e)
   }
}

/// Whether a process with the given PID exists.
///
/// On POSIX, `kill(pid, 0)` succeeding or failing with `EPERM` means
/// the process is alive; `ESRCH` means it is gone.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
   let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
   rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// On platforms without a liveness probe, treat every owner as alive so
/// the lock is never stolen from a running process.
#[cfg(not(unix))]
pub fn is_pid_alive(_pid: u32) -> bool {
   true
}
