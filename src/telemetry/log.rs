use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use tracing::{debug, info, warn};

use crate::llm::{self, Usage, pricing};
use crate::proxy::ProxyError;
use crate::proxy::identity::CallerIdentity;
use crate::store::{RequestRecord, Store};

/// Accumulates the durable record for one request. The handler fills fields
/// in as the request progresses; the record lands in the store exactly once,
/// when the response body completes or the log is dropped mid-stream.
pub struct RequestLog {
	pub request_id: String,
	pub provider: String,
	pub model: String,
	pub endpoint: String,
	pub method: String,
	pub status: u16,
	pub is_streaming: bool,
	pub caller: CallerIdentity,
	pub request_hash: String,
	pub error_type: String,
	pub error_message: String,
	pub usage: Usage,
	timestamp: DateTime<Utc>,
	start: Instant,
	ttft: Option<Instant>,
	capture: Option<BytesMut>,
	store: Arc<Store>,
	finished: bool,
}

impl RequestLog {
	pub fn new(store: Arc<Store>, request_id: String, method: String) -> Self {
		RequestLog {
			request_id,
			provider: String::new(),
			model: String::new(),
			endpoint: String::new(),
			method,
			status: 0,
			is_streaming: false,
			caller: CallerIdentity::default(),
			request_hash: String::new(),
			error_type: String::new(),
			error_message: String::new(),
			usage: Usage::default(),
			timestamp: Utc::now(),
			start: Instant::now(),
			ttft: None,
			capture: None,
			store,
			finished: false,
		}
	}

	pub fn set_error(&mut self, err: &ProxyError) {
		self.error_type = err.record_type().to_string();
		self.error_message = err.to_string();
	}

	/// Start teeing response chunks for end-of-stream usage parsing.
	pub fn enable_capture(&mut self) {
		self.capture = Some(BytesMut::new());
	}

	fn observe_chunk(&mut self, data: &[u8]) {
		if data.is_empty() {
			return;
		}
		if self.is_streaming && self.ttft.is_none() {
			self.ttft = Some(Instant::now());
		}
		if let Some(capture) = &mut self.capture {
			capture.extend_from_slice(data);
		}
	}

	/// Write the durable record and update budget spend. Requests that never
	/// resolved a route leave no record.
	fn finish(&mut self) {
		if self.finished {
			return;
		}
		self.finished = true;
		if self.provider.is_empty() {
			debug!(request_id = %self.request_id, "request dropped before route resolution");
			return;
		}

		let capture = self.capture.take();
		if let Some(capture) = &capture {
			self
				.usage
				.merge_from(llm::usage::parse_sse(&self.provider, capture));
		}
		// Every row with an error status carries error fields, even when the
		// upstream body gave us nothing to parse.
		if self.status >= 400 && self.error_type.is_empty() {
			let (t, m) = capture
				.as_deref()
				.map(llm::usage::parse_error)
				.unwrap_or_default();
			self.error_type = if t.is_empty() { "upstream_error".to_string() } else { t };
			self.error_message = if m.is_empty() {
				format!("upstream returned status {}", self.status)
			} else {
				m
			};
		}
		let cost_cents = pricing::estimate_cents(&self.model, &self.usage);
		let latency_ms = self.start.elapsed().as_millis() as i64;
		let ttft_ms = self
			.ttft
			.map(|t| (t - self.start).as_millis() as i64)
			.unwrap_or(0);

		let record = RequestRecord {
			id: self.request_id.clone(),
			timestamp: self.timestamp,
			provider: self.provider.clone(),
			model: self.model.clone(),
			endpoint: self.endpoint.clone(),
			method: self.method.clone(),
			input_tokens: self.usage.input_tokens,
			output_tokens: self.usage.output_tokens,
			cache_read_tokens: self.usage.cache_read_tokens,
			cache_creation_tokens: self.usage.cache_creation_tokens,
			estimated_cost_cents: cost_cents,
			status_code: self.status as i64,
			latency_ms,
			ttft_ms,
			caller_pid: self.caller.pid,
			caller_name: self.caller.name.clone(),
			is_streaming: self.is_streaming,
			error_type: self.error_type.clone(),
			error_message: self.error_message.clone(),
			request_hash: self.request_hash.clone(),
		};
		if let Err(err) = self.store.append(&record) {
			warn!(request_id = %self.request_id, %err, "failed to append request record");
		}
		if self.status < 400
			&& cost_cents > 0
			&& let Err(err) = self.store.add_spend(&self.provider, cost_cents)
		{
			warn!(request_id = %self.request_id, %err, "failed to record budget spend");
		}

		info!(
			request_id = %self.request_id,
			provider = %self.provider,
			model = %self.model,
			endpoint = %self.endpoint,
			status = self.status,
			input_tokens = self.usage.input_tokens,
			output_tokens = self.usage.output_tokens,
			cost_cents,
			latency_ms,
			ttft_ms,
			streaming = self.is_streaming,
			caller = %self.caller.name,
			error = %self.error_type,
			"request"
		);
	}
}

/// Owns a [`RequestLog`] and guarantees the finalizer runs exactly once,
/// including when the client aborts mid-stream and the body is dropped.
pub struct DropOnLog {
	log: Option<RequestLog>,
}

impl DropOnLog {
	pub fn with(&mut self, f: impl FnOnce(&mut RequestLog)) {
		if let Some(log) = self.log.as_mut() {
			f(log)
		}
	}
}

impl From<RequestLog> for DropOnLog {
	fn from(log: RequestLog) -> Self {
		DropOnLog { log: Some(log) }
	}
}

impl Drop for DropOnLog {
	fn drop(&mut self) {
		if let Some(mut log) = self.log.take() {
			log.finish();
		}
	}
}

pin_project! {
	/// Response body wrapper: relays frames to the client unchanged while
	/// teeing data into the log for TTFT and end-of-stream usage parsing.
	pub struct LogBody<B> {
		#[pin]
		body: B,
		log: DropOnLog,
	}
}

impl<B> LogBody<B> {
	pub fn new(body: B, log: DropOnLog) -> Self {
		Self { body, log }
	}
}

impl<B> Body for LogBody<B>
where
	B: Body<Data = Bytes>,
{
	type Data = Bytes;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		let result = ready!(this.body.poll_frame(cx));
		match result {
			Some(Ok(frame)) => {
				if let Some(data) = frame.data_ref() {
					this.log.with(|log| log.observe_chunk(data));
				}
				Poll::Ready(Some(Ok(frame)))
			},
			Some(Err(e)) => Poll::Ready(Some(Err(e))),
			None => {
				// Stream complete: the record is final.
				if let Some(mut log) = this.log.log.take() {
					log.finish();
				}
				Poll::Ready(None)
			},
		}
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.body.size_hint()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn log_with_store() -> (Arc<Store>, RequestLog) {
		let store = Arc::new(Store::open_in_memory().unwrap());
		let log = RequestLog::new(store.clone(), crate::ulid::new(), "POST".to_string());
		(store, log)
	}

	#[test]
	fn finish_appends_record_and_spend() {
		let (store, mut log) = log_with_store();
		store
			.set_budget("openai", 100.0, crate::store::budget::Period::Daily)
			.unwrap();
		log.provider = "openai".to_string();
		log.model = "gpt-4o".to_string();
		log.endpoint = "/v1/chat/completions".to_string();
		log.status = 200;
		log.usage = Usage {
			input_tokens: 1_000_000,
			output_tokens: 1_000_000,
			..Default::default()
		};
		let id = log.request_id.clone();
		drop(DropOnLog::from(log));

		let rec = store.get(&id).unwrap().unwrap();
		assert_eq!(rec.estimated_cost_cents, 1250);
		assert_eq!(rec.status_code, 200);
		let budgets = store.budget_status().unwrap();
		assert_eq!(budgets[0].current_spend_cents, 1250);
	}

	#[test]
	fn unrouted_request_leaves_no_record() {
		let (store, log) = log_with_store();
		drop(DropOnLog::from(log));
		assert!(store.list(&Default::default()).unwrap().is_empty());
	}

	#[test]
	fn captured_stream_parses_usage_on_finish() {
		let (store, mut log) = log_with_store();
		log.provider = "anthropic".to_string();
		log.model = "claude-sonnet-4".to_string();
		log.status = 200;
		log.is_streaming = true;
		log.enable_capture();
		log.observe_chunk(b"data: {\"message\":{\"usage\":{\"input_tokens\":12}}}\n\n");
		log.observe_chunk(b"data: {\"usage\":{\"output_tokens\":34}}\n\n");
		log.observe_chunk(b"data: [DONE]\n\n");
		let id = log.request_id.clone();
		drop(DropOnLog::from(log));

		let rec = store.get(&id).unwrap().unwrap();
		assert_eq!(rec.input_tokens, 12);
		assert_eq!(rec.output_tokens, 34);
		assert!(rec.is_streaming);
		assert!(rec.ttft_ms >= 0);
		assert!(rec.latency_ms >= rec.ttft_ms);
	}

	#[test]
	fn failed_request_spends_nothing() {
		let (store, mut log) = log_with_store();
		store
			.set_budget("openai", 100.0, crate::store::budget::Period::Daily)
			.unwrap();
		log.provider = "openai".to_string();
		log.model = "gpt-4o".to_string();
		log.status = 502;
		log.usage.input_tokens = 1_000_000;
		log.error_type = "upstream_request_failed".to_string();
		drop(DropOnLog::from(log));

		assert_eq!(store.budget_status().unwrap()[0].current_spend_cents, 0);
	}
}
