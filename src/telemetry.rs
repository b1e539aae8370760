use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::LoggingConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Filter from `RUST_LOG` when set, otherwise the configured level
/// (`debug` when verbose). Noisy HTTP internals stay at `warn`.
fn build_filter(cfg: &LoggingConfig, verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { cfg.level.as_str() };
        EnvFilter::new(format!("{},hyper=warn,reqwest=warn,rustls=warn", level))
    })
}

fn stderr_layer(json: bool) -> BoxedLayer {
    if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_target(false).with_writer(std::io::stderr).boxed()
    }
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process or buffered file output is lost.
pub fn init(cfg: &LoggingConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let mut layers: Vec<BoxedLayer> = vec![stderr_layer(cfg.json)];

    let guard = match &cfg.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "testsmith.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer().with_ansi(false).with_writer(writer);
            layers.push(if cfg.json { file.json().boxed() } else { file.boxed() });
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(build_filter(cfg, verbose))
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}
