mod event;
mod logging;
mod manifest;
mod run;
mod settings;

use std::{path::PathBuf, process::ExitCode};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use relay_core::{models::redact_text, LogSummary};
use tracing::Instrument;

use crate::{event::Event, run::JobKind, settings::Settings};

#[derive(Parser)]
#[command(name = "relay", version, about = "Verified backup copies into object storage")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Back up CDN access logs
	CdnLog(RunArgs),
	/// Compute content hashes and store them as object tags
	Hash(RunArgs),
	/// Back up database backup files
	PgBackup(RunArgs),
}

#[derive(Args)]
struct RunArgs {
	/// Settings file (TOML)
	#[arg(long)]
	config: PathBuf,
	/// Invocation event (JSON)
	#[arg(long)]
	event: Option<PathBuf>,
	/// Also write logs to this file
	#[arg(long)]
	log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();
	let (kind, args) = match cli.command {
		Command::CdnLog(args) => (JobKind::CdnLog, args),
		Command::Hash(args) => (JobKind::Hash, args),
		Command::PgBackup(args) => (JobKind::PgBackup, args),
	};

	let _log_guard = match logging::init(args.log_file.as_deref()) {
		Ok(guard) => guard,
		Err(err) => {
			eprintln!("error: {err:#}");
			return ExitCode::from(2);
		}
	};

	match invoke(kind, &args).await {
		Ok(summary) => {
			println!("{summary}");
			if summary.is_success() {
				ExitCode::SUCCESS
			} else {
				ExitCode::FAILURE
			}
		}
		Err(err) => {
			let message = redact_text(&format!("{err:#}"));
			tracing::error!(error = %message, "invocation failed");
			eprintln!("error: {message}");
			ExitCode::from(2)
		}
	}
}

async fn invoke(kind: JobKind, args: &RunArgs) -> Result<LogSummary> {
	let mut settings = Settings::load(&args.config)?;
	settings.apply_env(|name| std::env::var(name).ok())?;
	let event = match &args.event {
		Some(path) => Event::load(path)?,
		None => Event::default(),
	};

	let request_id = event.context.request_id.clone().unwrap_or_else(|| ulid::Ulid::new().to_string());
	let span = tracing::info_span!("invocation", request_id = %request_id, job = ?kind);
	run::run(kind, settings, event, chrono::Utc::now()).instrument(span).await
}
