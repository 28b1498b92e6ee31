use url::Url;

use crate::config::Config;
use crate::proxy::ProxyError;

/// Resolved target for one request: where it goes and how it is logged.
#[derive(Debug, Clone)]
pub struct Route {
	pub provider: String,
	pub forwarded_url: Url,
	/// Path below the provider segment, always `/`-prefixed; recorded as the
	/// endpoint on the durable row.
	pub suffix: String,
}

/// Map `/<provider>/<rest>` onto the provider's upstream. The query string
/// passes through untouched.
pub fn resolve(config: &Config, path: &str, raw_query: Option<&str>) -> Result<Route, ProxyError> {
	let trimmed = path.strip_prefix('/').unwrap_or(path);
	let (provider, rest) = match trimmed.split_once('/') {
		Some((p, rest)) => (p, rest),
		None => (trimmed, ""),
	};
	if provider.is_empty() {
		return Err(ProxyError::InvalidRoute(format!(
			"path {path:?} does not name a provider"
		)));
	}
	let provider = provider.to_ascii_lowercase();
	let Some(pc) = config.providers.get(&provider) else {
		return Err(ProxyError::UnsupportedProvider { provider });
	};

	let joined = join_paths(pc.upstream.path(), rest);
	let mut forwarded_url = pc.upstream.clone();
	forwarded_url.set_path(&joined);
	forwarded_url.set_query(raw_query);

	let suffix = {
		let rest = collapse_slashes(rest);
		let rest = rest.trim_start_matches('/');
		format!("/{rest}")
	};

	Ok(Route {
		provider,
		forwarded_url,
		suffix,
	})
}

/// Join the upstream's base path with the request remainder, producing
/// exactly one `/` at every boundary. A trailing slash survives iff the
/// remainder had one.
fn join_paths(base: &str, rest: &str) -> String {
	let trailing = rest.ends_with('/');
	let base = base.trim_end_matches('/');
	let rest = rest.trim_start_matches('/');
	let mut joined = collapse_slashes(&format!("{base}/{rest}"));
	if !trailing {
		while joined.len() > 1 && joined.ends_with('/') {
			joined.pop();
		}
	}
	joined
}

fn collapse_slashes(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	let mut prev_slash = false;
	for c in s.chars() {
		if c == '/' {
			if prev_slash {
				continue;
			}
			prev_slash = true;
		} else {
			prev_slash = false;
		}
		out.push(c);
	}
	out
}
