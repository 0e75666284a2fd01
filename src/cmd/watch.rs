//! Watcher driver: maintains a RECENT hierarchy for a live tree.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
   Result,
   collection::Recent,
   error::Error,
   fsck,
   interval::Interval,
   metrics::{self, Metrics},
   recentfile::Recentfile,
   watcher::{Watcher, WatcherConfig},
};

/// Parameters for the `watch` subcommand.
pub struct WatchArgs {
   pub local_root: PathBuf,
   pub interval: String,
   pub aggregator: Vec<String>,
   pub format: String,
   pub batch_size: usize,
   pub batch_delay: Duration,
   pub aggregate_interval: Duration,
   pub metrics_port: u16,
   pub skip_fsck: bool,
   pub fsck_repair: bool,
}

/// How often the queue-depth gauge samples watcher statistics.
const GAUGE_INTERVAL: Duration = Duration::from_secs(5);

pub async fn execute(args: WatchArgs) -> Result<()> {
   let local_root = args
      .local_root
      .canonicalize()
      .map_err(|e| Error::from(e).context("resolve local root", &args.local_root))?;
   if !local_root.is_dir() {
      return Err(Error::Invariant(format!(
         "local root is not a directory: {}",
         local_root.display()
      )));
   }

   let interval: Interval = args.interval.parse()?;
   let suffix = match args.format.as_str() {
      "yaml" | "yml" => ".yaml",
      "json" => ".json",
      other => return Err(Error::UnsupportedSuffix(other.to_string())),
   };
   let aggregator: Vec<Interval> = args
      .aggregator
      .iter()
      .map(|token| token.parse())
      .collect::<Result<_>>()?;

   tracing::info!(
      local_root = %local_root.display(),
      interval = %interval,
      format = suffix,
      batch_size = args.batch_size,
      batch_delay = ?args.batch_delay,
      aggregate_interval = ?args.aggregate_interval,
      metrics_port = args.metrics_port,
      "starting watch driver"
   );

   let rec = Arc::new(create_or_load(&local_root, interval, suffix, aggregator)?);

   if args.skip_fsck {
      tracing::info!("skipping startup fsck");
   } else {
      tracing::info!(auto_repair = args.fsck_repair, "running startup fsck");
      let report = fsck::run(
         &rec,
         &fsck::Options { repair: args.fsck_repair, skip_events: false, verbose: false },
      )?;
      if report.issues > 0 && !report.repaired {
         return Err(Error::FsckIssues { issues: report.issues });
      }
      if report.repaired {
         tracing::info!(issues = report.issues, "startup fsck repaired issues");
      }
   }

   let token = CancellationToken::new();
   let metrics = Metrics::new();
   tokio::spawn(metrics::serve(
      Arc::clone(&metrics),
      args.metrics_port,
      token.clone(),
   ));

   let events_metrics = Arc::clone(&metrics);
   let agg_metrics = Arc::clone(&metrics);
   let config = WatcherConfig {
      batch_size: args.batch_size,
      batch_delay: args.batch_delay,
      aggregate_interval: (!args.aggregate_interval.is_zero()).then_some(args.aggregate_interval),
      error_handler: Some(Arc::new(|e: &Error| tracing::error!("watcher error: {e}"))),
      event_callback: Some(Arc::new(move |kind, count| {
         events_metrics.record_events(kind, count);
      })),
      aggregation_callback: Some(Arc::new(move |duration| {
         agg_metrics.record_aggregation(duration);
      })),
      ..WatcherConfig::default()
   };

   let mut watcher = Watcher::new(Arc::clone(&rec), config)?;
   watcher.start()?;
   tracing::info!("watcher started");

   let monitor = watcher.monitor();
   let gauge_metrics = Arc::clone(&metrics);
   let gauge_token = token.clone();
   tokio::spawn(async move {
      let mut tick = tokio::time::interval(GAUGE_INTERVAL);
      loop {
         tokio::select! {
            _ = tick.tick() => {
               let stats = monitor.stats();
               gauge_metrics.set_queue_depth(stats.queued_events + stats.batch_len);
            },
            _ = gauge_token.cancelled() => break,
         }
      }
   });

   wait_for_shutdown().await;
   tracing::info!("received shutdown signal");

   token.cancel();
   watcher.stop().await;
   tracing::info!("watcher stopped");

   tracing::info!("running final aggregation");
   let final_rec = Arc::clone(&rec);
   tokio::task::spawn_blocking(move || final_rec.aggregate(false))
      .await
      .map_err(|e| Error::TaskFailed(e.to_string()))??;

   let stats = rec.stats();
   tracing::info!(
      total_events = stats.total_events,
      intervals = stats.intervals,
      "shutdown complete"
   );
   Ok(())
}

/// Loads an existing hierarchy from the principal file, or creates a
/// fresh one (with all files on disk) when none exists yet.
fn create_or_load(
   local_root: &std::path::Path,
   interval: Interval,
   suffix: &str,
   aggregator: Vec<Interval>,
) -> Result<Recent> {
   let principal_path = local_root.join(format!("RECENT-{interval}{suffix}"));

   if principal_path.exists() {
      tracing::info!(principal = %principal_path.display(), "loading existing collection");
      let rec = Recent::open(&principal_path)?;
      rec.load_all()?;
      return Ok(rec);
   }

   tracing::info!(principal = %principal_path.display(), "creating new collection");
   let principal = Recentfile::new(local_root, interval, suffix)?.with_aggregator(aggregator);
   let rec = Recent::with_principal(principal)?;
   rec.ensure_files_exist()?;
   Ok(rec)
}

async fn wait_for_shutdown() {
   #[cfg(unix)]
   {
      let mut sigterm =
         tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
      let sigterm_fut = async {
         match sigterm.as_mut() {
            Some(sigterm) => {
               sigterm.recv().await;
            },
            None => std::future::pending().await,
         }
      };
      tokio::select! {
         _ = tokio::signal::ctrl_c() => {},
         _ = sigterm_fut => {},
      }
   }

   #[cfg(not(unix))]
   {
      let _ = tokio::signal::ctrl_c().await;
   }
}
