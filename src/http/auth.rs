use ::http::{HeaderMap, HeaderName, HeaderValue, header};
use secrecy::{ExposeSecret, SecretString};

use crate::proxy::ProxyError;

/// Headers that convey caller credentials. Matching is by canonical header
/// name only, never by value content: a caller header like
/// `X-Custom-Header: bearer-ish` must survive sanitization.
static CREDENTIAL_HEADERS: [HeaderName; 6] = [
	header::AUTHORIZATION,
	header::PROXY_AUTHORIZATION,
	HeaderName::from_static("x-api-key"),
	HeaderName::from_static("api-key"),
	HeaderName::from_static("x-goog-api-key"),
	HeaderName::from_static("openai-organization"),
];

/// Remove every caller-supplied credential header. The vault key injected
/// afterwards is the only credential the upstream sees.
pub fn sanitize(headers: &mut HeaderMap) {
	for h in CREDENTIAL_HEADERS.iter() {
		headers.remove(h);
	}
}

/// Set the provider-specific credential header and any version pins.
pub fn inject(headers: &mut HeaderMap, provider: &str, key: &SecretString) -> Result<(), ProxyError> {
	let key = key.expose_secret().trim();
	if key.is_empty() {
		return Err(ProxyError::MissingApiKey {
			provider: provider.to_string(),
		});
	}
	match provider {
		"anthropic" => {
			headers.insert("x-api-key", sensitive(key)?);
			// https://docs.anthropic.com/en/api/versioning
			headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
		},
		"google" => {
			headers.insert("x-goog-api-key", sensitive(key)?);
		},
		// openai, mistral, groq, openrouter, and anything user-defined
		_ => {
			headers.insert(header::AUTHORIZATION, sensitive(&format!("Bearer {key}"))?);
		},
	}
	Ok(())
}

fn sensitive(value: &str) -> Result<HeaderValue, ProxyError> {
	let mut hv = HeaderValue::from_str(value).map_err(|_| ProxyError::AuthInjectionFailed {
		reason: "key contains bytes not valid in a header value".to_string(),
	})?;
	hv.set_sensitive(true);
	Ok(hv)
}
