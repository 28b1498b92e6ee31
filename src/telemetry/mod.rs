pub mod log;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `TOKFENCE_LOG` filters output,
/// defaulting to info.
pub fn init() {
	let filter = EnvFilter::try_from_env("TOKFENCE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.init();
}
