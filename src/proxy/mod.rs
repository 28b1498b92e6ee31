pub mod handler;
pub mod identity;
pub mod route;

use ::http::{StatusCode, header};
use serde_json::json;

use crate::http::{Body, Response, X_TOKFENCE_REQUEST_ID};
use crate::store::StoreError;
use crate::store::budget::BudgetExceeded;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("{0}")]
	InvalidRoute(String),
	#[error("provider {provider} is not configured")]
	UnsupportedProvider { provider: String },
	#[error("provider {provider} is revoked")]
	ProviderRevoked { provider: String },
	#[error("budget exceeded for {}", .0.provider)]
	BudgetExceeded(BudgetExceeded),
	#[error("rate limit exceeded for {provider}")]
	RateLimitExceeded { provider: String },
	#[error("request body exceeds {limit} bytes")]
	RequestTooLarge { limit: usize },
	#[error("failed to read request body: {0}")]
	ReadRequestFailed(String),
	#[error("failed to build upstream request: {0}")]
	RequestBuildFailed(String),
	#[error("no API key for provider {provider}; store one in the vault or set the provider environment variable")]
	MissingApiKey { provider: String },
	#[error("failed to inject credentials: {reason}")]
	AuthInjectionFailed { reason: String },
	#[error("revocation lookup failed: {0}")]
	StatusLookupFailed(StoreError),
	#[error("budget check failed: {0}")]
	BudgetCheckFailed(StoreError),
	#[error("rate limit lookup failed: {0}")]
	RatelimitLookupFailed(StoreError),
	#[error("upstream request failed: {0}")]
	UpstreamRequestFailed(String),
}

impl ProxyError {
	/// Wire-level kind, `tokfence_` prefixed, used as `error.type` in the
	/// response envelope.
	pub fn kind(&self) -> &'static str {
		match self {
			// An unknown provider is a routing failure on the wire.
			ProxyError::InvalidRoute(_) | ProxyError::UnsupportedProvider { .. } => {
				"tokfence_invalid_route"
			},
			ProxyError::ProviderRevoked { .. } => "tokfence_provider_revoked",
			ProxyError::BudgetExceeded(_) => "tokfence_budget_exceeded",
			ProxyError::RateLimitExceeded { .. } => "tokfence_rate_limit_exceeded",
			ProxyError::RequestTooLarge { .. } => "tokfence_request_too_large",
			ProxyError::ReadRequestFailed(_) => "tokfence_read_request_failed",
			ProxyError::RequestBuildFailed(_) => "tokfence_request_build_failed",
			ProxyError::MissingApiKey { .. } => "tokfence_missing_api_key",
			ProxyError::AuthInjectionFailed { .. } => "tokfence_auth_injection_failed",
			ProxyError::StatusLookupFailed(_) => "tokfence_status_lookup_failed",
			ProxyError::BudgetCheckFailed(_) => "tokfence_budget_check_failed",
			ProxyError::RatelimitLookupFailed(_) => "tokfence_ratelimit_lookup_failed",
			ProxyError::UpstreamRequestFailed(_) => "tokfence_upstream_request_failed",
		}
	}

	/// `error_type` recorded on the durable row: the kind without the wire
	/// prefix.
	pub fn record_type(&self) -> &'static str {
		self
			.kind()
			.strip_prefix("tokfence_")
			.expect("every kind carries the prefix")
	}

	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::InvalidRoute(_) | ProxyError::UnsupportedProvider { .. } => {
				StatusCode::BAD_REQUEST
			},
			ProxyError::ProviderRevoked { .. } => StatusCode::FORBIDDEN,
			ProxyError::BudgetExceeded(_) | ProxyError::RateLimitExceeded { .. } => {
				StatusCode::TOO_MANY_REQUESTS
			},
			ProxyError::RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
			ProxyError::ReadRequestFailed(_) => StatusCode::BAD_REQUEST,
			ProxyError::RequestBuildFailed(_) => StatusCode::BAD_REQUEST,
			ProxyError::MissingApiKey { .. } => StatusCode::UNAUTHORIZED,
			ProxyError::AuthInjectionFailed { .. } => StatusCode::UNAUTHORIZED,
			ProxyError::StatusLookupFailed(_)
			| ProxyError::BudgetCheckFailed(_)
			| ProxyError::RatelimitLookupFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::UpstreamRequestFailed(_) => StatusCode::BAD_GATEWAY,
		}
	}

	pub fn provider(&self) -> Option<&str> {
		match self {
			ProxyError::UnsupportedProvider { provider }
			| ProxyError::ProviderRevoked { provider }
			| ProxyError::RateLimitExceeded { provider }
			| ProxyError::MissingApiKey { provider } => Some(provider),
			ProxyError::BudgetExceeded(e) => Some(&e.provider),
			_ => None,
		}
	}

	/// Build the JSON error envelope. Every core-generated 4xx/5xx goes
	/// through here so callers can rely on one shape.
	pub fn into_response(self, request_id: &str) -> Response {
		let mut error = json!({
			"type": self.kind(),
			"message": self.to_string(),
			"request_id": request_id,
		});
		if let Some(provider) = self.provider() {
			error["provider"] = json!(provider);
		}
		if let ProxyError::BudgetExceeded(e) = &self {
			error["limit_cents"] = json!(e.limit_cents);
			error["current_spend_cents"] = json!(e.current_spend_cents);
			error["resets_at"] = json!(crate::store::rfc3339(e.resets_at));
		}

		let mut builder = ::http::Response::builder()
			.status(self.status())
			.header(header::CONTENT_TYPE, "application/json")
			.header(X_TOKFENCE_REQUEST_ID, request_id);
		if matches!(self, ProxyError::RateLimitExceeded { .. }) {
			builder = builder.header(header::RETRY_AFTER, "1");
		}
		let body = serde_json::to_vec(&json!({ "error": error })).unwrap_or_default();
		builder
			.body(Body::from(body))
			.expect("static response parts are valid")
	}
}

#[cfg(test)]
mod tests {
	use chrono::Utc;

	use super::*;

	#[test]
	fn envelope_shape() {
		let err = ProxyError::ProviderRevoked {
			provider: "openai".to_string(),
		};
		assert_eq!(err.status(), StatusCode::FORBIDDEN);
		assert_eq!(err.kind(), "tokfence_provider_revoked");
		assert_eq!(err.record_type(), "provider_revoked");
	}

	#[test]
	fn rate_limit_sets_retry_after() {
		let err = ProxyError::RateLimitExceeded {
			provider: "openai".to_string(),
		};
		let resp = err.into_response("01ABC");
		assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
		assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "1");
		assert_eq!(resp.headers().get(X_TOKFENCE_REQUEST_ID).unwrap(), "01ABC");
	}

	#[test]
	fn budget_envelope_carries_limits() {
		let err = ProxyError::BudgetExceeded(BudgetExceeded {
			provider: "openai".to_string(),
			limit_cents: 100,
			current_spend_cents: 1250,
			resets_at: Utc::now(),
		});
		let resp = err.into_response("01ABC");
		assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
	}
}
