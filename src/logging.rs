use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_FILTER: &str = "page_translator=debug";

/// Installs a stderr subscriber when verbose. `RUST_LOG` overrides the filter.
pub fn init(verbose: bool) -> Result<()> {
    if !verbose {
        return Ok(());
    }
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
    Ok(())
}
