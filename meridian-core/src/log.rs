pub use log::{trace, debug, info, warn, error, LevelFilter};

/// Install `env_logger` as the global logger. `RUST_LOG` overrides `level`.
pub fn initialize(level: LevelFilter) -> Result<(), anyhow::Error> {
    env_logger::builder()
        .filter_level(level)
        // Per-command tracing is only enabled through RUST_LOG.
        .filter_module("meridian_rhi::command", level.min(LevelFilter::Debug))
        .parse_default_env()
        .try_init()?;

    Ok(())
}
