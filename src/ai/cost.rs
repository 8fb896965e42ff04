//! Token estimation and provider cost table.
//!
//! Estimates are deliberately conservative (20% buffer) so the budget gate
//! errs on the side of blocking. Rates are USD per million tokens, stored as
//! micros per token pair.

/// (provider, model, input rate, output rate) in USD per 1M tokens.
const PRICING: &[(&str, &str, f64, f64)] = &[
    ("openai", "gpt-4o-mini", 0.150, 0.600),
    ("openai", "gpt-4o", 2.50, 10.00),
    ("openai", "gpt-4-turbo", 10.00, 30.00),
    ("openai", "text-embedding-3-small", 0.020, 0.0),
    ("openai", "text-embedding-3-large", 0.130, 0.0),
    ("anthropic", "claude-3-opus", 15.00, 75.00),
    ("anthropic", "claude-3-sonnet", 3.00, 15.00),
    ("anthropic", "claude-3-haiku", 0.25, 1.25),
    ("scripted", "scripted-v1", 0.0, 0.0),
];

/// Rates for (provider, model), or `None` when the pair is unknown.
pub fn model_rates(provider: &str, model: &str) -> Option<(f64, f64)> {
    let provider = provider.to_ascii_lowercase();
    let model = model.to_ascii_lowercase();
    PRICING
        .iter()
        .find(|(p, m, _, _)| *p == provider && *m == model)
        .map(|(_, _, input, output)| (*input, *output))
}

/// Cost of a call in micro-USD; unknown models cost zero rather than failing
/// the call that already happened.
pub fn calculate_cost_micros(
    provider: &str,
    model: &str,
    input_tokens: i64,
    output_tokens: i64,
) -> i64 {
    let Some((input_rate, output_rate)) = model_rates(provider, model) else {
        return 0;
    };
    let input_cost = (input_tokens as f64 * input_rate) / 1_000_000.0;
    let output_cost = (output_tokens as f64 * output_rate) / 1_000_000.0;
    ((input_cost + output_cost) * 1_000_000.0).round() as i64
}

/// Text tokens ≈ ⌈chars/4⌉ with a 20% buffer.
pub fn estimate_text_tokens(text: &str) -> i64 {
    let base = (text.len() as f64 / 4.0).ceil();
    (base * 1.2).ceil() as i64
}

/// Vision tokens ≈ (500 + 1500 × pages) with a 20% buffer.
pub fn estimate_vision_tokens(page_count: usize) -> i64 {
    let base = 500.0 + 1500.0 * page_count as f64;
    (base * 1.2).ceil() as i64
}

/// Estimated cost in micros for a prospective call, assuming a typical
/// structured-output completion of ~2000 tokens.
pub fn estimate_call_cost_micros(provider: &str, model: &str, input_tokens: i64) -> i64 {
    calculate_cost_micros(provider, model, input_tokens, 2000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_cost() {
        // 1000 in + 500 out on gpt-4o-mini: 0.00015 + 0.0003 = 0.00045 USD
        assert_eq!(calculate_cost_micros("openai", "gpt-4o-mini", 1000, 500), 450);
    }

    #[test]
    fn unknown_model_costs_zero() {
        assert_eq!(calculate_cost_micros("acme", "mystery", 1000, 1000), 0);
    }

    #[test]
    fn text_estimate_has_buffer() {
        // 400 chars -> 100 tokens base -> 120 with buffer
        let text = "x".repeat(400);
        assert_eq!(estimate_text_tokens(&text), 120);
    }

    #[test]
    fn vision_estimate_scales_with_pages() {
        assert_eq!(estimate_vision_tokens(0), 600);
        assert_eq!(estimate_vision_tokens(2), 4200);
    }
}
