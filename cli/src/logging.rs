use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Structured logs to stderr, plus a plain file when `log_file` is set.
/// Keep the returned guard alive until exit so buffered lines are flushed.
pub fn init(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

	match log_file {
		Some(path) => {
			let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
			let name = path
				.file_name()
				.with_context(|| format!("log file {} has no file name", path.display()))?;
			std::fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;

			let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
			tracing_subscriber::registry()
				.with(filter)
				.with(stderr)
				.with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
				.try_init()
				.context("installing tracing subscriber")?;
			Ok(Some(guard))
		}
		None => {
			tracing_subscriber::registry()
				.with(filter)
				.with(stderr)
				.try_init()
				.context("installing tracing subscriber")?;
			Ok(None)
		}
	}
}
