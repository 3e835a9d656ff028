//! Disk quota model daemon, running the engine against an in-process demo
//! cluster. Production embeds the engine against the real host instead.
#[macro_use]
extern crate slog_scope;

use std::error::Error;
use std::sync::Arc;

use docopt::Docopt;
use serde::Deserialize;

use segquota::host::mock::MockCluster;
use segquota::logging::{self, init_logging};
use segquota::types::SchemaVersion;
use segquota::worker::Launcher;
use segquota_common::{metrics_from_opts, BlockingThreadpool, Metrics};
use segquota_settings::Settings;
use segquota_store::StorePool;

const USAGE: &str = "
Usage: segquotad [options]

Options:
    -h, --help               Show this message.
    --config=CONFIGFILE      Segquota configuration file path.
    --segments=N             Size of the demo cluster [default: 3].
";

#[derive(Debug, Deserialize)]
struct Args {
    flag_config: Option<String>,
    flag_segments: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());
    let settings = Settings::with_env_and_config_file(args.flag_config.as_deref())?;
    init_logging(!settings.human_logs).expect("Logging failed to initialize");
    debug!("Starting up...");

    let metrics_client = metrics_from_opts(
        &settings.statsd_label,
        settings.statsd_host.as_deref(),
        settings.statsd_port,
    )?;
    let metrics = Metrics::from(&metrics_client);

    let blocking_threadpool = Arc::new(BlockingThreadpool::default());
    let store = StorePool::new(&settings, &metrics, blocking_threadpool)
        .expect("Could not open the metadata store");

    let data_root = std::env::temp_dir().join("segquota-demo");
    let cluster = MockCluster::new(args.flag_segments, &settings, data_root);

    let launcher = Launcher::new(
        cluster.context(),
        store,
        settings.clone(),
        metrics,
        SchemaVersion::V2,
    );
    let supervisor = launcher.spawn();
    info!("Daemon running, {}", settings.banner());

    tokio::signal::ctrl_c().await?;
    info!("Daemon closing");
    launcher.shutdown_flag().trigger();
    let _ = supervisor.await;
    logging::reset_logging();

    Ok(())
}
