//! Watcher-driver observability counters.
//!
//! The core only invokes callbacks; this module is the collaborator the
//! CLI wires those callbacks into. Counters are relaxed atomics
//! (metrics are advisory, not transactional) rendered in Prometheus
//! text format by a small exposition listener.

use std::{
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
   time::Duration,
};

use tokio::{
   io::{AsyncReadExt, AsyncWriteExt},
   net::TcpListener,
};
use tokio_util::sync::CancellationToken;

use crate::recentfile::EventType;

const HISTOGRAM_BUCKETS: &[f64] = &[0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 30.0];

/// Shared counters for the watch driver.
#[derive(Debug, Default)]
pub struct Metrics {
   events_new:       AtomicU64,
   events_delete:    AtomicU64,
   aggregation_runs: AtomicU64,
   /// Histogram of aggregation durations: per-bucket counts plus sum
   /// in microseconds.
   agg_bucket_counts: [AtomicU64; HISTOGRAM_BUCKETS.len()],
   agg_duration_sum_us: AtomicU64,
   events_in_queue:  AtomicU64,
}

impl Metrics {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn record_events(&self, kind: EventType, count: usize) {
      let counter = match kind {
         EventType::New => &self.events_new,
         EventType::Delete => &self.events_delete,
      };
      counter.fetch_add(count as u64, Ordering::Relaxed);
   }

   pub fn record_aggregation(&self, duration: Duration) {
      self.aggregation_runs.fetch_add(1, Ordering::Relaxed);
      self
         .agg_duration_sum_us
         .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
      let secs = duration.as_secs_f64();
      for (i, bound) in HISTOGRAM_BUCKETS.iter().enumerate() {
         if secs <= *bound {
            self.agg_bucket_counts[i].fetch_add(1, Ordering::Relaxed);
         }
      }
   }

   pub fn set_queue_depth(&self, depth: usize) {
      self.events_in_queue.store(depth as u64, Ordering::Relaxed);
   }

   /// Prometheus text exposition.
   pub fn render(&self) -> String {
      use std::fmt::Write;

      let mut out = String::new();
      let _ = writeln!(
         out,
         "# HELP mirrorlog_events_processed_total File system events processed"
      );
      let _ = writeln!(out, "# TYPE mirrorlog_events_processed_total counter");
      let _ = writeln!(
         out,
         "mirrorlog_events_processed_total{{type=\"new\"}} {}",
         self.events_new.load(Ordering::Relaxed)
      );
      let _ = writeln!(
         out,
         "mirrorlog_events_processed_total{{type=\"delete\"}} {}",
         self.events_delete.load(Ordering::Relaxed)
      );

      let runs = self.aggregation_runs.load(Ordering::Relaxed);
      let _ = writeln!(out, "# HELP mirrorlog_aggregation_runs_total Aggregation passes");
      let _ = writeln!(out, "# TYPE mirrorlog_aggregation_runs_total counter");
      let _ = writeln!(out, "mirrorlog_aggregation_runs_total {runs}");

      let _ = writeln!(
         out,
         "# HELP mirrorlog_aggregation_duration_seconds Time per aggregation pass"
      );
      let _ = writeln!(out, "# TYPE mirrorlog_aggregation_duration_seconds histogram");
      for (i, bound) in HISTOGRAM_BUCKETS.iter().enumerate() {
         let _ = writeln!(
            out,
            "mirrorlog_aggregation_duration_seconds_bucket{{le=\"{bound}\"}} {}",
            self.agg_bucket_counts[i].load(Ordering::Relaxed)
         );
      }
      let _ = writeln!(
         out,
         "mirrorlog_aggregation_duration_seconds_bucket{{le=\"+Inf\"}} {runs}"
      );
      let _ = writeln!(
         out,
         "mirrorlog_aggregation_duration_seconds_sum {}",
         self.agg_duration_sum_us.load(Ordering::Relaxed) as f64 / 1e6
      );
      let _ = writeln!(out, "mirrorlog_aggregation_duration_seconds_count {runs}");

      let _ = writeln!(out, "# HELP mirrorlog_events_in_queue Events queued for processing");
      let _ = writeln!(out, "# TYPE mirrorlog_events_in_queue gauge");
      let _ = writeln!(
         out,
         "mirrorlog_events_in_queue {}",
         self.events_in_queue.load(Ordering::Relaxed)
      );

      out
   }
}

/// Serves `/metrics` until cancelled. Listens on all interfaces at
/// `port`; any request path answers with the full exposition.
pub async fn serve(metrics: Arc<Metrics>, port: u16, token: CancellationToken) {
   let listener = match TcpListener::bind(("0.0.0.0", port)).await {
      Ok(listener) => listener,
      Err(e) => {
         tracing::error!("metrics listener on port {port}: {e}");
         return;
      },
   };
   tracing::info!(port, "metrics server listening");

   loop {
      tokio::select! {
         accepted = listener.accept() => {
            let Ok((mut stream, _)) = accepted else { continue };
            let metrics = Arc::clone(&metrics);
            tokio::spawn(async move {
               let mut buf = [0u8; 1024];
               let _ = stream.read(&mut buf).await;
               let body = metrics.render();
               let response = format!(
                  "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                  body.len(),
                  body
               );
               let _ = stream.write_all(response.as_bytes()).await;
               let _ = stream.shutdown().await;
            });
         },
         _ = token.cancelled() => break,
      }
   }
}
