use serde_json::Value;

use crate::llm::Usage;

/// Extract token usage from a buffered (non-stream) JSON response body.
/// Returns zeroed counters when the body is not JSON or carries no usage.
pub fn parse_json(provider: &str, body: &[u8]) -> Usage {
	let Ok(root) = serde_json::from_slice::<Value>(body) else {
		return Usage::default();
	};
	usage_from_value(provider, &root)
}

/// Extract token usage from a captured SSE stream. Scans `data:` lines,
/// skipping blanks and the `[DONE]` sentinel; malformed chunks are ignored.
/// Later non-zero counters override earlier ones, matching providers that
/// report usage incrementally across events.
pub fn parse_sse(provider: &str, body: &[u8]) -> Usage {
	let mut usage = Usage::default();
	let text = String::from_utf8_lossy(body);
	for line in text.lines() {
		let Some(data) = line.strip_prefix("data:") else {
			continue;
		};
		let data = data.trim();
		if data.is_empty() || data == "[DONE]" {
			continue;
		}
		let Ok(chunk) = serde_json::from_str::<Value>(data) else {
			continue;
		};
		usage.merge_from(usage_from_value(provider, &chunk));
	}
	usage
}

/// `(error.type, error.message)` from an upstream error body. Providers that
/// return a bare string under `error` get it as the message with an empty
/// type.
pub fn parse_error(body: &[u8]) -> (String, String) {
	let Ok(root) = serde_json::from_slice::<Value>(body) else {
		return (String::new(), String::new());
	};
	match root.get("error") {
		Some(Value::Object(err)) => {
			let typ = err
				.get("type")
				.and_then(Value::as_str)
				.unwrap_or_default()
				.to_string();
			let msg = err
				.get("message")
				.and_then(Value::as_str)
				.unwrap_or_default()
				.to_string();
			(typ, msg)
		},
		Some(Value::String(msg)) => (String::new(), msg.clone()),
		_ => (String::new(), String::new()),
	}
}

fn usage_from_value(provider: &str, root: &Value) -> Usage {
	// Anthropic nests usage under `message` in stream start events.
	let Some(usage) = root
		.get("usage")
		.or_else(|| root.get("message").and_then(|m| m.get("usage")))
	else {
		return Usage::default();
	};

	let field = |name: &str| usage.get(name).map(coerce_tokens).unwrap_or(0);

	let (input, output) = if provider == "anthropic" {
		(field("input_tokens"), field("output_tokens"))
	} else {
		let input = first_non_zero(field("input_tokens"), field("prompt_tokens"));
		let output = first_non_zero(field("output_tokens"), field("completion_tokens"));
		(input, output)
	};

	Usage {
		input_tokens: input,
		output_tokens: output,
		cache_read_tokens: field("cache_read_input_tokens"),
		cache_creation_tokens: field("cache_creation_input_tokens"),
	}
}

fn first_non_zero(a: i64, b: i64) -> i64 {
	if a != 0 { a } else { b }
}

/// Providers disagree on number encoding: integers mostly, but floats and
/// quoted numbers appear in the wild. Floats truncate toward zero.
fn coerce_tokens(v: &Value) -> i64 {
	match v {
		Value::Number(n) => n
			.as_i64()
			.or_else(|| n.as_f64().map(|f| f as i64))
			.unwrap_or(0),
		Value::String(s) => s
			.trim()
			.parse::<i64>()
			.or_else(|_| s.trim().parse::<f64>().map(|f| f as i64))
			.unwrap_or(0),
		_ => 0,
	}
}
