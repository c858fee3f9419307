use clap::ValueEnum;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::error::{Error, ErrorDetails};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

const DEFAULT_DIRECTIVE: &str = "gateway=info,mentor_internal=info,warn";
const DEBUG_DIRECTIVE: &str = "gateway=debug,mentor_internal=debug,warn";

/// Handle for turning on debug logging after the config file has been read.
/// Logging has to come up before the config is loaded so that config errors
/// are visible, which is why the debug switch is applied late.
pub struct DelayedDebugLogs {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl DelayedDebugLogs {
    pub fn enable_debug(&self) -> Result<(), Error> {
        self.handle
            .reload(EnvFilter::new(DEBUG_DIRECTIVE))
            .map_err(|e| {
                Error::new(ErrorDetails::AppState {
                    message: format!("Failed to enable debug logs: {e}"),
                })
            })
    }
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// directive when set.
pub fn setup_observability(log_format: LogFormat) -> Result<DelayedDebugLogs, Error> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let (env_filter, reload_handle) = reload::Layer::new(env_filter);

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };

    result.map_err(|e| {
        Error::new(ErrorDetails::AppState {
            message: format!("Failed to initialize tracing: {e}"),
        })
    })?;

    Ok(DelayedDebugLogs {
        handle: reload_handle,
    })
}
