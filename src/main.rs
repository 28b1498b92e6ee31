use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use tokfence::config::{Config, Overrides};
use tokfence::proxy::handler::{self, Gateway};
use tokfence::store::Store;
use tokfence::vault::EmptyVault;
use tokfence::telemetry;

/// Local-first egress gateway for AI agent traffic.
#[derive(Parser, Debug)]
#[command(name = "tokfence", version, about)]
struct Args {
	/// Path to the TOML config file.
	#[arg(long)]
	config: Option<PathBuf>,

	/// Listen port on 127.0.0.1 (overrides the config file).
	#[arg(long)]
	port: Option<u16>,

	/// Data directory (defaults to ~/.tokfence).
	#[arg(long)]
	data_dir: Option<PathBuf>,

	/// Also serve on a unix domain socket at this path.
	#[arg(long)]
	unix_socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	telemetry::init();
	let args = Args::parse();

	let config = Arc::new(Config::load(
		args.config.as_deref(),
		&Overrides {
			port: args.port,
			data_dir: args.data_dir,
			unix_socket: args.unix_socket,
		},
	)?);

	let store = Arc::new(Store::open(&config.data_dir)?);
	let swept = store.delete_older_than(config.retention_days)?;
	if swept > 0 {
		info!(swept, retention_days = config.retention_days, "pruned old request records");
	}

	let gateway = Gateway::new(config, store, Arc::new(EmptyVault));
	handler::serve(gateway).await
}
