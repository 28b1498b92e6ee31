use std::net::SocketAddr;
use std::time::Duration;

use ::http::HeaderMap;

use crate::http::X_TOKFENCE_AGENT;

/// Hard ceiling on the identity probe. The probe is advisory; the request
/// never waits longer than this for it.
const PROBE_BUDGET: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Default)]
pub struct CallerIdentity {
	pub pid: i64,
	pub name: String,
}

/// Best-effort identification of the loopback peer. A self-declared
/// `X-Tokfence-Agent` header wins; otherwise the OS is asked who owns the
/// peer port. Failure is silent.
pub async fn resolve(headers: &HeaderMap, peer: Option<SocketAddr>) -> CallerIdentity {
	if let Some(agent) = headers.get(&X_TOKFENCE_AGENT)
		&& let Ok(name) = agent.to_str()
		&& !name.trim().is_empty()
	{
		return CallerIdentity {
			pid: 0,
			name: name.trim().to_string(),
		};
	}
	let Some(peer) = peer else {
		return CallerIdentity::default();
	};
	match tokio::time::timeout(PROBE_BUDGET, probe_port(peer.port())).await {
		Ok(Some(id)) => id,
		_ => CallerIdentity::default(),
	}
}

#[cfg(unix)]
async fn probe_port(port: u16) -> Option<CallerIdentity> {
	let output = tokio::process::Command::new("lsof")
		.args([
			"-nP",
			&format!("-iTCP:{port}"),
			"-sTCP:ESTABLISHED",
			"-Fpc",
		])
		.kill_on_drop(true)
		.output()
		.await
		.ok()?;
	if !output.status.success() {
		return None;
	}
	parse_lsof(&String::from_utf8_lossy(&output.stdout), std::process::id())
}

#[cfg(not(unix))]
async fn probe_port(_port: u16) -> Option<CallerIdentity> {
	None
}

/// lsof -F emits one field per line: `p<pid>` then `c<command>`. Both ends of
/// the loopback connection match the port query, so our own pid is skipped.
#[cfg_attr(not(unix), allow(dead_code))]
fn parse_lsof(out: &str, self_pid: u32) -> Option<CallerIdentity> {
	let mut pid: Option<i64> = None;
	for line in out.lines() {
		if let Some(p) = line.strip_prefix('p') {
			pid = p.parse::<i64>().ok().filter(|p| *p != self_pid as i64);
		} else if let Some(c) = line.strip_prefix('c')
			&& let Some(pid) = pid
		{
			return Some(CallerIdentity {
				pid,
				name: c.to_string(),
			});
		}
	}
	None
}
