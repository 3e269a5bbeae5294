//! Per-token pricing for the models we route to.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// (input, output) USD cost per token for `model`.
///
/// Matched by family prefix; unknown models get the mid-tier price.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    let model = model.to_ascii_lowercase();
    if model.contains("haiku") {
        (dec!(0.0000008), dec!(0.000004))
    } else if model.contains("opus") {
        (dec!(0.000015), dec!(0.000075))
    } else if model.contains("sonnet") {
        (dec!(0.000003), dec!(0.000015))
    } else if model.starts_with("gpt-4o-mini") || model.starts_with("gpt-4.1-mini") {
        (dec!(0.00000015), dec!(0.0000006))
    } else if model.starts_with("gpt-4o") || model.starts_with("gpt-4.1") {
        (dec!(0.0000025), dec!(0.00001))
    } else {
        (dec!(0.000003), dec!(0.000015))
    }
}
