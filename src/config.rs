use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::{env, fs};

use anyhow::{Context, bail};
use serde::Deserialize;
use url::Url;

pub const DEFAULT_PORT: u16 = 9471;
pub const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;
pub const DEFAULT_RETENTION_DAYS: u32 = 90;

/// Longest unix socket pathname we will accept. sun_path is 104 bytes on the
/// BSDs including the NUL terminator.
pub const MAX_UNIX_SOCKET_PATH: usize = 103;

/// Upstream target for one provider tag.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
	pub upstream: Url,
	/// Literal headers applied to every outbound request for this provider,
	/// after sanitization and credential injection.
	pub extra_headers: BTreeMap<String, String>,
}

/// Immutable runtime configuration. Built once at startup and shared as an
/// `Arc` snapshot; the request path never observes a partial update.
#[derive(Debug, Clone)]
pub struct Config {
	pub listen: SocketAddr,
	pub unix_socket: Option<PathBuf>,
	pub data_dir: PathBuf,
	pub retention_days: u32,
	pub max_body_bytes: usize,
	pub providers: BTreeMap<String, ProviderConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
	listen: Option<String>,
	port: Option<u16>,
	unix_socket: Option<PathBuf>,
	data_dir: Option<PathBuf>,
	retention_days: Option<u32>,
	max_request_body_bytes: Option<usize>,
	#[serde(default)]
	providers: BTreeMap<String, RawProvider>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProvider {
	upstream: Option<Url>,
	#[serde(default)]
	extra_headers: BTreeMap<String, String>,
}

/// Command-line overrides applied on top of the config file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
	pub port: Option<u16>,
	pub data_dir: Option<PathBuf>,
	pub unix_socket: Option<PathBuf>,
}

impl Config {
	pub fn load(file: Option<&std::path::Path>, overrides: &Overrides) -> anyhow::Result<Config> {
		let raw = match file {
			Some(path) => {
				let contents = fs::read_to_string(path)
					.with_context(|| format!("read config {}", path.display()))?;
				toml::from_str::<RawConfig>(&contents)
					.with_context(|| format!("parse config {}", path.display()))?
			},
			None => RawConfig::default(),
		};
		Self::from_raw(raw, overrides)
	}

	fn from_raw(raw: RawConfig, overrides: &Overrides) -> anyhow::Result<Config> {
		let port = overrides.port.or(raw.port).unwrap_or(DEFAULT_PORT);
		let listen = match &raw.listen {
			Some(s) => {
				let ip: IpAddr = s.parse().with_context(|| format!("parse listen address {s}"))?;
				SocketAddr::new(ip, port)
			},
			None => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
		};
		if !listen.ip().is_loopback() {
			bail!(
				"refusing to bind {}: tokfence serves loopback callers only",
				listen.ip()
			);
		}

		let unix_socket = overrides.unix_socket.clone().or(raw.unix_socket);
		if let Some(p) = &unix_socket
			&& p.as_os_str().len() > MAX_UNIX_SOCKET_PATH
		{
			bail!(
				"unix socket path {} exceeds {} bytes",
				p.display(),
				MAX_UNIX_SOCKET_PATH
			);
		}

		let data_dir = overrides
			.data_dir
			.clone()
			.or(raw.data_dir)
			.or_else(|| dirs::home_dir().map(|h| h.join(".tokfence")))
			.context("cannot determine data directory; pass --data-dir")?;

		let max_body_bytes = match env::var("TOKFENCE_MAX_REQUEST_BODY_BYTES") {
			Ok(v) => v
				.parse::<usize>()
				.context("parse TOKFENCE_MAX_REQUEST_BODY_BYTES")?,
			Err(_) => raw
				.max_request_body_bytes
				.unwrap_or(DEFAULT_MAX_BODY_BYTES),
		};

		let mut providers = builtin_providers();
		for (tag, rp) in raw.providers {
			let tag = tag.to_ascii_lowercase();
			match providers.get_mut(&tag) {
				Some(existing) => {
					if let Some(u) = rp.upstream {
						validate_upstream(&tag, &u)?;
						existing.upstream = u;
					}
					existing.extra_headers.extend(rp.extra_headers);
				},
				None => {
					let upstream = rp
						.upstream
						.with_context(|| format!("provider {tag} needs an upstream url"))?;
					validate_upstream(&tag, &upstream)?;
					providers.insert(
						tag,
						ProviderConfig {
							upstream,
							extra_headers: rp.extra_headers,
						},
					);
				},
			}
		}

		Ok(Config {
			listen,
			unix_socket,
			data_dir,
			retention_days: raw.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS),
			max_body_bytes,
			providers,
		})
	}
}

fn validate_upstream(tag: &str, url: &Url) -> anyhow::Result<()> {
	if !matches!(url.scheme(), "http" | "https") {
		bail!("provider {tag}: upstream {url} must be http or https");
	}
	if url.host_str().is_none() {
		bail!("provider {tag}: upstream {url} has no host");
	}
	Ok(())
}

fn builtin(upstream: &str) -> ProviderConfig {
	ProviderConfig {
		upstream: Url::parse(upstream).expect("builtin upstream urls parse"),
		extra_headers: BTreeMap::new(),
	}
}

pub fn builtin_providers() -> BTreeMap<String, ProviderConfig> {
	BTreeMap::from([
		("openai".to_string(), builtin("https://api.openai.com")),
		("anthropic".to_string(), builtin("https://api.anthropic.com")),
		(
			"google".to_string(),
			builtin("https://generativelanguage.googleapis.com"),
		),
		("mistral".to_string(), builtin("https://api.mistral.ai")),
		("groq".to_string(), builtin("https://api.groq.com")),
		(
			"openrouter".to_string(),
			builtin("https://openrouter.ai/api"),
		),
	])
}
