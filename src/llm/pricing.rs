use crate::llm::Usage;

/// USD per million tokens, (input, output). Longest matching prefix wins so
/// dated snapshots (`gpt-4o-2024-08-06`) price like their base model. Cache
/// tokens are not separately priced.
const PRICES: &[(&str, f64, f64)] = &[
	("gpt-4o-mini", 0.15, 0.60),
	("gpt-4o", 2.50, 10.00),
	("gpt-4.1-mini", 0.40, 1.60),
	("gpt-4.1-nano", 0.10, 0.40),
	("gpt-4.1", 2.00, 8.00),
	("o3-mini", 1.10, 4.40),
	("o3", 2.00, 8.00),
	("o4-mini", 1.10, 4.40),
	("claude-opus-4", 15.00, 75.00),
	("claude-sonnet-4", 3.00, 15.00),
	("claude-3-7-sonnet", 3.00, 15.00),
	("claude-3-5-sonnet", 3.00, 15.00),
	("claude-3-5-haiku", 0.80, 4.00),
	("claude-3-haiku", 0.25, 1.25),
	("claude-3-opus", 15.00, 75.00),
	("gemini-2.5-pro", 1.25, 10.00),
	("gemini-2.5-flash", 0.30, 2.50),
	("gemini-2.0-flash-lite", 0.075, 0.30),
	("gemini-2.0-flash", 0.10, 0.40),
	("gemini-1.5-pro", 1.25, 5.00),
	("gemini-1.5-flash", 0.075, 0.30),
	("mistral-large", 2.00, 6.00),
	("mistral-small", 0.10, 0.30),
	("codestral", 0.30, 0.90),
	("llama-3.3-70b", 0.59, 0.79),
	("llama-3.1-8b", 0.05, 0.08),
	("deepseek-r1-distill-llama-70b", 0.75, 0.99),
];

/// Deterministic cost estimate in integer cents. Unknown models cost 0.
pub fn estimate_cents(model: &str, usage: &Usage) -> i64 {
	let Some((_, in_price, out_price)) = lookup(model) else {
		return 0;
	};
	let dollars = (usage.input_tokens as f64 / 1e6) * in_price
		+ (usage.output_tokens as f64 / 1e6) * out_price;
	(dollars * 100.0).round() as i64
}

fn lookup(model: &str) -> Option<(&'static str, f64, f64)> {
	PRICES
		.iter()
		.filter(|(prefix, _, _)| model.starts_with(prefix))
		.max_by_key(|(prefix, _, _)| prefix.len())
		.copied()
}
