pub mod auth;
pub mod ratelimit;

use ::http::{HeaderMap, HeaderName, header};

pub type Body = axum::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

pub const X_TOKFENCE_REQUEST_ID: HeaderName = HeaderName::from_static("x-tokfence-request-id");
pub const X_TOKFENCE_AGENT: HeaderName = HeaderName::from_static("x-tokfence-agent");

// Hop-by-hop headers. Removed on both copy directions: caller headers going
// upstream and upstream response headers coming back.
static HOP_HEADERS: [HeaderName; 8] = [
	header::CONNECTION,
	// non-standard but still sent by libcurl and rejected by e.g. google
	HeaderName::from_static("proxy-connection"),
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
	for h in HOP_HEADERS.iter() {
		headers.remove(h);
	}
}

/// Does the response advertise an event stream?
pub fn is_event_stream(headers: &HeaderMap) -> bool {
	headers
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.to_ascii_lowercase().contains("text/event-stream"))
		.unwrap_or(false)
}

#[cfg(test)]
mod tests {
	use ::http::HeaderValue;

	use super::*;

	#[test]
	fn strips_hop_by_hop_both_casings() {
		let mut h = HeaderMap::new();
		h.insert("Connection", HeaderValue::from_static("keep-alive"));
		h.insert("keep-alive", HeaderValue::from_static("timeout=5"));
		h.insert("Transfer-Encoding", HeaderValue::from_static("chunked"));
		h.insert("content-type", HeaderValue::from_static("application/json"));
		strip_hop_by_hop(&mut h);
		assert_eq!(h.len(), 1);
		assert!(h.contains_key("content-type"));
	}

	#[test]
	fn event_stream_detection() {
		let mut h = HeaderMap::new();
		h.insert(
			"content-type",
			HeaderValue::from_static("text/event-stream; charset=utf-8"),
		);
		assert!(is_event_stream(&h));
		h.insert("content-type", HeaderValue::from_static("application/json"));
		assert!(!is_event_stream(&h));
	}
}
