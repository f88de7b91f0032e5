//! Tracing initialization.
//!
//! The filter is read from `RUST_LOG` and falls back to `info`. For example, to see every
//! skipped duplicate settlement and the rollback target only at error level:
//!
//! ```bash
//! export RUST_LOG="info,sheetpay::checkout=debug,sheetpay::rollback=error"
//! ```

use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global subscriber: an env filter plus console output.
pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()?;

    info!("Telemetry initialized");
    Ok(())
}
