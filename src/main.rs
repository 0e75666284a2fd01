use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use mirrorlog::cmd::{self, watch::WatchArgs};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the mirrorlog application
#[derive(Parser)]
#[command(name = "mirrorlog")]
#[command(about = "Append-style RECENT change index for mirrored file trees")]
#[command(version)]
struct Cli {
   #[arg(
      long,
      default_value = "info",
      help = "Log level (trace, debug, info, warn, error)"
   )]
   log_level: String,

   #[command(subcommand)]
   command: Cmd,
}

/// Available subcommands for mirrorlog
#[derive(Subcommand)]
enum Cmd {
   #[command(about = "Watch a tree and maintain its RECENT hierarchy")]
   Watch {
      #[arg(help = "Local root directory to watch")]
      local_root: PathBuf,

      #[arg(short = 'i', long, default_value = "1h", help = "Principal recentfile interval")]
      interval: String,

      #[arg(
         short = 'a',
         long,
         value_delimiter = ',',
         help = "Aggregator intervals, e.g. 6h,1d,1W,1M,1Q,1Y,Z"
      )]
      aggregator: Vec<String>,

      #[arg(
         short = 'f',
         long,
         default_value = "yaml",
         help = "Serialization format (yaml or json)"
      )]
      format: String,

      #[arg(long, default_value = "1000", help = "Maximum batch size before flushing")]
      batch_size: usize,

      #[arg(long, default_value = "1", help = "Maximum delay before flushing (seconds)")]
      batch_delay: u64,

      #[arg(
         long,
         default_value = "300",
         help = "How often to run aggregation (seconds, 0 disables)"
      )]
      aggregate_interval: u64,

      #[arg(long, default_value = "9090", help = "Port for the metrics server")]
      metrics_port: u16,

      #[arg(long, help = "Skip the startup integrity check")]
      skip_fsck: bool,

      #[arg(long, help = "Auto-repair issues found during startup fsck")]
      fsck_repair: bool,
   },

   #[command(about = "Verify and repair RECENT file integrity")]
   Fsck {
      #[arg(help = "Path to the principal RECENT file (e.g. RECENT-1h.yaml)")]
      principal_file: PathBuf,

      #[arg(short = 'r', long, help = "Repair issues found (otherwise just report)")]
      repair: bool,

      #[arg(long, help = "Skip parsing events (faster, less thorough)")]
      skip_events: bool,

      #[arg(short = 'v', long, help = "Enable verbose output")]
      verbose: bool,
   },
}

#[tokio::main]
async fn main() {
   let cli = Cli::parse();

   let filter = EnvFilter::try_from_default_env()
      .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
   tracing_subscriber::fmt().with_env_filter(filter).init();

   let result = match cli.command {
      Cmd::Watch {
         local_root,
         interval,
         aggregator,
         format,
         batch_size,
         batch_delay,
         aggregate_interval,
         metrics_port,
         skip_fsck,
         fsck_repair,
      } => {
         cmd::watch::execute(WatchArgs {
            local_root,
            interval,
            aggregator,
            format,
            batch_size,
            batch_delay: Duration::from_secs(batch_delay),
            aggregate_interval: Duration::from_secs(aggregate_interval),
            metrics_port,
            skip_fsck,
            fsck_repair,
         })
         .await
      },
      Cmd::Fsck { principal_file, repair, skip_events, verbose } => {
         cmd::fsck::execute(principal_file, repair, skip_events, verbose)
      },
   };

   if let Err(e) = result {
      eprintln!("error: {e}");
      std::process::exit(1);
   }
}
