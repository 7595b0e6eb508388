//! Process entry point: CLI parsing, config resolution, logger init,
//! signal handling, and wiring the runtime together. Grounded in the
//! teacher's `main()` (`ctrlc`-driven `AtomicBool` shutdown flag,
//! `env_logger` init) and in the original `ids/main.py`'s top-level
//! `if __name__ == "__main__"` block, generalized behind [`nids::runtime::Runtime`].

use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use nids::config::{Cli, RuntimeConfig};
use nids::runtime::Runtime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = RuntimeConfig::resolve(cli)?;
    log::info!("starting nids with config: {config:?}");

    let runtime = Runtime::new(config.clone())?;

    let running = runtime.running_flag();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        running.store(false, Ordering::SeqCst);
    })?;

    let sweepers = runtime.spawn_sweepers();

    let runtime_for_control = Arc::new(runtime);
    let control_runtime = runtime_for_control.clone();
    let control_handle = tokio::spawn(async move {
        if let Err(e) = control_runtime.serve_control_plane().await {
            log::error!("control plane exited: {e}");
        }
    });

    if let Some(interface) = config.interface.clone() {
        let capture_runtime = runtime_for_control.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = capture_runtime.run_capture(&interface) {
                log::error!("capture loop exited: {e}");
            }
        })
        .await?;
        // The capture loop only returns once `running` is false, at which
        // point the control plane's graceful-shutdown future resolves too.
        control_handle.await?;
    } else {
        log::info!("no --interface given, running in control-plane-only mode");
        control_handle.await?;
    }

    for sweeper in sweepers {
        let _ = sweeper.join();
    }

    Ok(())
}
