//! Diagnostic logging setup for the `uru` binary.

use std::error::Error;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Environment variable holding `tracing` filter directives.
pub const LOG_ENV: &str = "URU_LOG";
const DEFAULT_DIRECTIVES: &str = "warn";

static SUBSCRIBER_GUARD: OnceLock<()> = OnceLock::new();

/// Build a filter from `directives`, falling back to `warn` when they are
/// missing or unparsable.
pub fn filter_from(directives: Option<&str>) -> EnvFilter {
    directives
        .map(str::trim)
        .filter(|directives| !directives.is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Install the global subscriber. Logs go to stderr, or are appended to
/// `log_file` when given. Calling this more than once is a no-op.
pub fn init_tracing(log_file: Option<&Path>) -> Result<(), Box<dyn Error>> {
    if SUBSCRIBER_GUARD.get().is_some() {
        return Ok(());
    }

    let directives = std::env::var(LOG_ENV).ok();
    let filter = filter_from(directives.as_deref());
    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(file));
            tracing::subscriber::set_global_default(Registry::default().with(filter).with(layer))?;
        }
        None => {
            let layer = fmt::layer().with_writer(std::io::stderr);
            tracing::subscriber::set_global_default(Registry::default().with(filter).with(layer))?;
        }
    }
    SUBSCRIBER_GUARD.set(()).ok();

    Ok(())
}
