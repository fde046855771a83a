use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tb_app::cli;
use tb_app::config_loader;
use tb_app::config_loader::GateConfigFile;
use tb_app::gate;
use tb_app::tracing_setup;
use tb_ratelimit::Bucket;
use tb_ratelimit::KeyedLimiter;
use tracing::Level;
use tracing::info;
use tracing::warn;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = cli::config_path(cli::DEFAULT_CONFIG_PATH);
    let (config, load_error) = match config_loader::load_gate_config(&path) {
        Ok(config) => (config, None),
        Err(err) => (GateConfigFile::default(), Some(err)),
    };

    let _guard = tracing_setup::init("tb_gate", config.log_dir.as_deref(), Level::INFO);
    match load_error {
        Some(err) => warn!("Failed to load gate config from {}: {}. Using defaults.", path, err),
        None => info!("Loaded gate config from {path}"),
    }

    let bucket = Arc::new(Bucket::from_config(&config.bucket)?);
    info!(capacity = bucket.capacity(), interval = ?bucket.interval(), refill = ?bucket.refill_mode(), "Gate ready");

    let sweeper = bucket.idle_timeout().map(|_| bucket.spawn_sweeper(Duration::from_millis(config.sweep_interval_ms)));

    let running = Arc::new(AtomicBool::new(true));
    gate::install_shutdown_handler(Arc::clone(&running))?;

    let limiter: Arc<dyn KeyedLimiter> = bucket.clone();
    let lines = gate::spawn_reader(io::BufReader::new(io::stdin()));
    let answered = tokio::task::spawn_blocking(move || {
        let stdout = io::stdout();
        gate::serve(limiter.as_ref(), &lines, stdout.lock(), &running)
    })
    .await??;

    info!(answered, keys = bucket.len(), "Gate stopped, shutting down");

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    Ok(())
}
