//! Per-model token pricing for activity accounting.
//!
//! Prices are USD per million tokens. Unknown models cost `None` rather
//! than a guessed figure.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

struct ModelPrice {
    model: &'static str,
    input_per_million: Decimal,
    output_per_million: Decimal,
}

static PRICES: &[ModelPrice] = &[
    ModelPrice {
        model: "gpt-4o-mini",
        input_per_million: dec!(0.150),
        output_per_million: dec!(0.600),
    },
    ModelPrice {
        model: "gpt-4o",
        input_per_million: dec!(2.50),
        output_per_million: dec!(10.00),
    },
    ModelPrice {
        model: "claude-3-5-haiku-latest",
        input_per_million: dec!(0.80),
        output_per_million: dec!(4.00),
    },
    ModelPrice {
        model: "claude-3-5-sonnet-latest",
        input_per_million: dec!(3.00),
        output_per_million: dec!(15.00),
    },
];

/// Cost of one generation, if the model is priced.
pub fn cost_for(model: &str, input_tokens: i64, output_tokens: i64) -> Option<Decimal> {
    let price = PRICES.iter().find(|p| p.model == model)?;
    let million = dec!(1000000);
    Some(
        Decimal::from(input_tokens) * price.input_per_million / million
            + Decimal::from(output_tokens) * price.output_per_million / million,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_costs_add_up() {
        let cost = cost_for("claude-3-5-haiku-latest", 1_000_000, 1_000_000).unwrap();
        assert_eq!(cost, dec!(4.80));
    }

    #[test]
    fn small_calls_cost_fractions() {
        let cost = cost_for("gpt-4o-mini", 1000, 100).unwrap();
        assert_eq!(cost, dec!(0.00015) + dec!(0.00006));
    }

    #[test]
    fn unknown_model_has_no_cost() {
        assert!(cost_for("some-local-model", 100, 100).is_none());
    }
}
