pub mod pricing;
pub mod usage;

/// Token counters extracted from an upstream response. Counters the provider
/// omitted stay zero; accounting is best-effort by design.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Usage {
	pub input_tokens: i64,
	pub output_tokens: i64,
	pub cache_read_tokens: i64,
	pub cache_creation_tokens: i64,
}

impl Usage {
	pub fn is_empty(&self) -> bool {
		*self == Usage::default()
	}

	/// Fold a later observation into this one. Non-zero fields win; a stream
	/// reports usage incrementally and the last non-zero value is the total.
	pub fn merge_from(&mut self, other: Usage) {
		if other.input_tokens != 0 {
			self.input_tokens = other.input_tokens;
		}
		if other.output_tokens != 0 {
			self.output_tokens = other.output_tokens;
		}
		if other.cache_read_tokens != 0 {
			self.cache_read_tokens = other.cache_read_tokens;
		}
		if other.cache_creation_tokens != 0 {
			self.cache_creation_tokens = other.cache_creation_tokens;
		}
	}
}
