use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use ::http::{HeaderName, HeaderValue, StatusCode, header};
use anyhow::Context as _;
use axum::Router;
use axum::extract::{ConnectInfo, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::client::RESPONSE_HEADER_TIMEOUT;
use crate::config::Config;
use crate::http::{self, Body, Request, Response, X_TOKFENCE_REQUEST_ID, auth};
use crate::http::ratelimit::RateLimiter;
use crate::llm::usage;
use crate::proxy::{ProxyError, identity, route};
use crate::store::{GroupBy, ListFilter, Store};
use crate::telemetry::log::{DropOnLog, LogBody, RequestLog};
use crate::vault::Vault;
use crate::{ulid, vault};

const BODY_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything one request needs, shared across all handlers. Immutable after
/// startup apart from the interior-mutable store, limiter, and client pools.
pub struct Gateway {
	pub config: Arc<Config>,
	pub store: Arc<Store>,
	vault: Arc<dyn Vault>,
	limiter: RateLimiter,
	client: reqwest::Client,
	started_at: DateTime<Utc>,
	addr: OnceLock<String>,
}

impl Gateway {
	pub fn new(config: Arc<Config>, store: Arc<Store>, vault: Arc<dyn Vault>) -> Arc<Gateway> {
		Arc::new(Gateway {
			config,
			store,
			vault,
			limiter: RateLimiter::new(),
			client: crate::client::build(),
			started_at: Utc::now(),
			addr: OnceLock::new(),
		})
	}

	fn display_addr(&self) -> String {
		self
			.addr
			.get()
			.cloned()
			.unwrap_or_else(|| self.config.listen.to_string())
	}
}

pub fn router(gateway: Arc<Gateway>) -> Router {
	Router::new()
		.route("/__tokfence/health", get(health))
		.route("/__tokfence/requests", get(list_requests))
		.route("/__tokfence/stats", get(stats))
		.route("/__tokfence/budgets", get(budgets))
		.fallback(proxy)
		.with_state(gateway)
}

/// Bind the configured TCP listener (and unix socket, when set) and serve
/// until ctrl-c.
pub async fn serve(gateway: Arc<Gateway>) -> anyhow::Result<()> {
	let listener = TcpListener::bind(gateway.config.listen)
		.await
		.with_context(|| format!("bind {}", gateway.config.listen))?;
	serve_on(gateway, listener).await
}

/// Serve on an already-bound listener. Tests bind port 0 and drive the
/// gateway through this.
pub async fn serve_on(gateway: Arc<Gateway>, listener: TcpListener) -> anyhow::Result<()> {
	let local = listener.local_addr().context("listener local addr")?;
	let _ = gateway.addr.set(local.to_string());
	let app = router(gateway.clone());

	#[cfg(unix)]
	if let Some(path) = &gateway.config.unix_socket {
		let uds = bind_unix(path)?;
		let app = app.clone();
		tokio::spawn(async move {
			if let Err(err) = axum::serve(uds, app.into_make_service()).await {
				warn!(%err, "unix socket listener exited");
			}
		});
		info!(socket = %path.display(), "listening on unix socket");
	}

	info!(
		addr = %local,
		providers = gateway.config.providers.len(),
		data_dir = %gateway.config.data_dir.display(),
		"tokfence listening"
	);
	axum::serve(
		listener,
		app.into_make_service_with_connect_info::<SocketAddr>(),
	)
	.with_graceful_shutdown(shutdown_signal())
	.await
	.context("serve")
}

#[cfg(unix)]
fn bind_unix(path: &std::path::Path) -> anyhow::Result<tokio::net::UnixListener> {
	use std::os::unix::fs::PermissionsExt;

	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)?;
		std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
	}
	// A stale socket from a previous run would fail the bind.
	if path.exists() {
		std::fs::remove_file(path)?;
	}
	let listener = tokio::net::UnixListener::bind(path)
		.with_context(|| format!("bind unix socket {}", path.display()))?;
	std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))?;
	Ok(listener)
}

async fn shutdown_signal() {
	if let Err(err) = tokio::signal::ctrl_c().await {
		warn!(%err, "failed to install ctrl-c handler");
		std::future::pending::<()>().await;
	}
	info!("shutting down");
}

async fn health(State(gateway): State<Arc<Gateway>>) -> axum::Json<Value> {
	axum::Json(json!({
		"name": "tokfence",
		"status": "ok",
		"addr": gateway.display_addr(),
		"started_at": crate::store::rfc3339(gateway.started_at),
	}))
}

#[derive(Debug, Deserialize)]
struct QueryParams {
	provider: Option<String>,
	model: Option<String>,
	since: Option<DateTime<Utc>>,
	limit: Option<u32>,
	group_by: Option<String>,
}

impl QueryParams {
	fn filter(&self) -> ListFilter {
		ListFilter {
			provider: self.provider.clone(),
			model: self.model.clone(),
			since: self.since,
			limit: self.limit,
		}
	}
}

fn store_failure(err: crate::store::StoreError) -> axum::response::Response {
	(
		StatusCode::INTERNAL_SERVER_ERROR,
		axum::Json(json!({ "error": { "message": err.to_string() } })),
	)
		.into_response()
}

async fn list_requests(
	State(gateway): State<Arc<Gateway>>,
	Query(params): Query<QueryParams>,
) -> axum::response::Response {
	match gateway.store.list(&params.filter()) {
		Ok(rows) => axum::Json(rows).into_response(),
		Err(err) => store_failure(err),
	}
}

async fn stats(
	State(gateway): State<Arc<Gateway>>,
	Query(params): Query<QueryParams>,
) -> axum::response::Response {
	let group_by = match params.group_by.as_deref().unwrap_or("provider").parse::<GroupBy>() {
		Ok(g) => g,
		Err(err) => {
			return (
				StatusCode::BAD_REQUEST,
				axum::Json(json!({ "error": { "message": err.to_string() } })),
			)
				.into_response();
		},
	};
	match gateway.store.stats(&params.filter(), group_by) {
		Ok(rows) => axum::Json(rows).into_response(),
		Err(err) => store_failure(err),
	}
}

async fn budgets(State(gateway): State<Arc<Gateway>>) -> axum::response::Response {
	match gateway.store.budget_status() {
		Ok(rows) => axum::Json(rows).into_response(),
		Err(err) => store_failure(err),
	}
}

/// The proxy path. Every response leaves through here wrapped in a
/// [`LogBody`], so the durable record lands exactly once, after the last
/// byte (or the abort).
async fn proxy(State(gateway): State<Arc<Gateway>>, req: Request) -> Response {
	let request_id = ulid::new();
	let mut log: DropOnLog = RequestLog::new(
		gateway.store.clone(),
		request_id.clone(),
		req.method().to_string(),
	)
	.into();

	let result = gateway.proxy_internal(req, &request_id, &mut log).await;
	let mut resp = match result {
		Ok(resp) => resp,
		Err(err) => {
			debug!(request_id = %request_id, %err, "request denied");
			log.with(|l| l.set_error(&err));
			err.into_response(&request_id)
		},
	};
	log.with(|l| l.status = resp.status().as_u16());
	if let Ok(hv) = HeaderValue::from_str(&request_id) {
		resp.headers_mut().insert(X_TOKFENCE_REQUEST_ID, hv);
	}
	resp.map(|b| Body::new(LogBody::new(b, log)))
}

impl Gateway {
	async fn proxy_internal(
		&self,
		req: Request,
		request_id: &str,
		log: &mut DropOnLog,
	) -> Result<Response, ProxyError> {
		// Classify.
		let path = req.uri().path().to_string();
		let query = req.uri().query().map(str::to_string);
		let route = route::resolve(&self.config, &path, query.as_deref())?;
		log.with(|l| {
			l.provider = route.provider.clone();
			l.endpoint = route.suffix.clone();
		});

		// Gate: revocation, then budget, then rate limit.
		if self
			.store
			.is_provider_revoked(&route.provider)
			.map_err(ProxyError::StatusLookupFailed)?
		{
			return Err(ProxyError::ProviderRevoked {
				provider: route.provider,
			});
		}
		if let Some(exceeded) = self
			.store
			.check_budget(&route.provider)
			.map_err(ProxyError::BudgetCheckFailed)?
		{
			return Err(ProxyError::BudgetExceeded(exceeded));
		}
		let rpm = self
			.store
			.get_rate_limit(&route.provider)
			.map_err(ProxyError::RatelimitLookupFailed)?;
		if let Some(rpm) = rpm
			&& !self.limiter.allow(&route.provider, rpm)
		{
			return Err(ProxyError::RateLimitExceeded {
				provider: route.provider,
			});
		}

		let (parts, body) = req.into_parts();
		let body_bytes = read_body(body, self.config.max_body_bytes).await?;

		// What the caller asked for, by its own account.
		let parsed: Option<Value> = serde_json::from_slice(&body_bytes).ok();
		let stream_requested = parsed
			.as_ref()
			.and_then(|v| v.get("stream"))
			.and_then(Value::as_bool)
			.unwrap_or(false);
		let model = parsed
			.as_ref()
			.and_then(|v| v.get("model"))
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_string();
		let request_hash = hex::encode(&Sha256::digest(&body_bytes)[..8]);
		let peer = parts
			.extensions
			.get::<ConnectInfo<SocketAddr>>()
			.map(|ci| ci.0);
		let caller = identity::resolve(&parts.headers, peer).await;
		log.with(|l| {
			l.model = model.clone();
			l.request_hash = request_hash;
			l.caller = caller;
		});

		// Authorize: vault key, never the caller's.
		let key = vault::resolve_key(self.vault.as_ref(), &route.provider)
			.await
			.map_err(|err| ProxyError::AuthInjectionFailed {
				reason: err.to_string(),
			})?
			.ok_or_else(|| ProxyError::MissingApiKey {
				provider: route.provider.clone(),
			})?;

		let mut headers = parts.headers.clone();
		http::strip_hop_by_hop(&mut headers);
		headers.remove(header::HOST);
		headers.remove(header::CONTENT_LENGTH);
		auth::sanitize(&mut headers);
		auth::inject(&mut headers, &route.provider, &key)?;
		if let Some(pc) = self.config.providers.get(&route.provider) {
			for (name, value) in &pc.extra_headers {
				let name = HeaderName::from_bytes(name.as_bytes())
					.map_err(|_| ProxyError::RequestBuildFailed(format!("bad extra header name {name:?}")))?;
				let value = HeaderValue::from_str(value)
					.map_err(|_| ProxyError::RequestBuildFailed(format!("bad extra header value for {name:?}")))?;
				headers.insert(name, value);
			}
		}
		if let Ok(hv) = HeaderValue::from_str(request_id) {
			headers.insert(X_TOKFENCE_REQUEST_ID, hv);
		}

		// Forward.
		let upstream_req = self
			.client
			.request(parts.method.clone(), route.forwarded_url.clone())
			.headers(headers)
			.body(body_bytes)
			.build()
			.map_err(|err| ProxyError::RequestBuildFailed(err.to_string()))?;
		let upstream_resp =
			match tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, self.client.execute(upstream_req)).await
			{
				Ok(Ok(resp)) => resp,
				Ok(Err(err)) => return Err(ProxyError::UpstreamRequestFailed(err.to_string())),
				Err(_) => {
					return Err(ProxyError::UpstreamRequestFailed(
						"timed out waiting for upstream response headers".to_string(),
					));
				},
			};

		// Observe: relay, teeing stream chunks for accounting.
		let status = upstream_resp.status();
		let mut resp_headers = upstream_resp.headers().clone();
		http::strip_hop_by_hop(&mut resp_headers);
		let is_streaming = stream_requested || http::is_event_stream(&resp_headers);
		log.with(|l| l.is_streaming = is_streaming);

		let body = if is_streaming {
			log.with(|l| l.enable_capture());
			Body::from_stream(upstream_resp.bytes_stream())
		} else {
			let bytes = upstream_resp
				.bytes()
				.await
				.map_err(|err| ProxyError::UpstreamRequestFailed(err.to_string()))?;
			log.with(|l| observe_buffered(l, status, &bytes));
			Body::from(bytes)
		};

		let mut resp = ::http::Response::new(body);
		*resp.status_mut() = status;
		*resp.headers_mut() = resp_headers;
		Ok(resp)
	}
}

/// Account a fully-buffered upstream response: usage on success, error
/// fields on failure.
fn observe_buffered(log: &mut RequestLog, status: StatusCode, bytes: &Bytes) {
	if status.as_u16() >= 400 {
		let (error_type, error_message) = usage::parse_error(bytes);
		log.error_type = error_type;
		log.error_message = error_message;
	} else {
		log.usage.merge_from(usage::parse_json(&log.provider, bytes));
	}
}

async fn read_body(body: Body, cap: usize) -> Result<Bytes, ProxyError> {
	match tokio::time::timeout(BODY_READ_TIMEOUT, axum::body::to_bytes(body, cap)).await {
		Ok(Ok(bytes)) => Ok(bytes),
		Ok(Err(err)) => {
			if is_length_limit(&err) {
				Err(ProxyError::RequestTooLarge { limit: cap })
			} else {
				Err(ProxyError::ReadRequestFailed(err.to_string()))
			}
		},
		Err(_) => Err(ProxyError::ReadRequestFailed(
			"timed out reading request body".to_string(),
		)),
	}
}

fn is_length_limit(err: &axum::Error) -> bool {
	let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
	while let Some(e) = source {
		if e.is::<http_body_util::LengthLimitError>() {
			return true;
		}
		source = e.source();
	}
	false
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn body_under_cap_reads_fully() {
		let body = Body::from(vec![b'a'; 512]);
		let bytes = read_body(body, 1024).await.unwrap();
		assert_eq!(bytes.len(), 512);
	}

	#[tokio::test]
	async fn body_over_cap_is_too_large() {
		let body = Body::from(vec![b'a'; 2048]);
		let err = read_body(body, 1024).await.unwrap_err();
		assert!(matches!(err, ProxyError::RequestTooLarge { limit: 1024 }));
	}
}
