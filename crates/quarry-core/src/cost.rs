//! Token and dollar accounting.
//!
//! Dollar amounts are stored as whole nano-dollars so that adding a set of
//! breakdowns gives the same total in any order.

use crate::message::TokenUsage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign};

const NANOS_PER_DOLLAR: f64 = 1_000_000_000.0;

/// An exact USD amount in nano-dollars.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Usd(u64);

impl Usd {
    /// Zero dollars.
    pub const ZERO: Usd = Usd(0);

    /// Builds an amount from nano-dollars.
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Builds an amount from a dollar value, rounded to the nearest nano-dollar.
    pub fn from_dollars(dollars: f64) -> Self {
        if dollars <= 0.0 || !dollars.is_finite() {
            return Self::ZERO;
        }
        Self((dollars * NANOS_PER_DOLLAR).round() as u64)
    }

    /// The raw nano-dollar count.
    pub const fn nanos(self) -> u64 {
        self.0
    }

    /// The amount as floating point dollars, for display only.
    pub fn as_dollars(self) -> f64 {
        self.0 as f64 / NANOS_PER_DOLLAR
    }
}

impl Add for Usd {
    type Output = Usd;

    fn add(self, rhs: Usd) -> Usd {
        Usd(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Usd {
    fn add_assign(&mut self, rhs: Usd) {
        *self = *self + rhs;
    }
}

impl fmt::Display for Usd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.4}", self.as_dollars())
    }
}

/// Per-token prices for one model, in nano-dollars per token.
///
/// One nano-dollar per token is $1.00 per million tokens / 1000, so
/// `input: 2500` reads as "$2.50 per 1M input tokens".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    /// Nano-dollars per input token.
    pub input: u64,
    /// Nano-dollars per output token.
    pub output: u64,
}

/// Used when the model is missing from [`PRICING`].
pub const DEFAULT_PRICING: ModelPricing = ModelPricing {
    input: 1000,
    output: 2000,
};

/// Known OpenRouter model prices.
pub const PRICING: &[(&str, ModelPricing)] = &[
    (
        "alibaba/tongyi-deepresearch-30b-a3b",
        ModelPricing { input: 500, output: 500 },
    ),
    ("openai/gpt-4o", ModelPricing { input: 2500, output: 10_000 }),
    ("openai/gpt-4o-mini", ModelPricing { input: 150, output: 600 }),
    (
        "openai/gpt-4-turbo",
        ModelPricing { input: 10_000, output: 30_000 },
    ),
    (
        "anthropic/claude-3.5-sonnet",
        ModelPricing { input: 3000, output: 15_000 },
    ),
    (
        "anthropic/claude-3-haiku",
        ModelPricing { input: 250, output: 1250 },
    ),
    (
        "meta-llama/llama-3.1-70b",
        ModelPricing { input: 520, output: 750 },
    ),
    (
        "google/gemini-pro-1.5",
        ModelPricing { input: 1250, output: 5000 },
    ),
];

/// Looks up pricing by exact id, then by the name after the `provider/` prefix.
pub fn pricing_for(model_id: &str) -> ModelPricing {
    if let Some((_, p)) = PRICING.iter().find(|(id, _)| *id == model_id) {
        return *p;
    }
    let bare = model_id.rsplit('/').next().unwrap_or(model_id);
    PRICING
        .iter()
        .find(|(id, _)| id.rsplit('/').next() == Some(bare))
        .map(|(_, p)| *p)
        .unwrap_or(DEFAULT_PRICING)
}

/// Token counts and their USD cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostBreakdown {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
    /// Total tokens as reported (input + output when not reported).
    pub total_tokens: u64,
    /// Cost of prompt tokens.
    pub input_cost: Usd,
    /// Cost of completion tokens.
    pub output_cost: Usd,
    /// `input_cost + output_cost`.
    pub total_cost: Usd,
}

impl CostBreakdown {
    /// Prices a completion for `model_id`. A zero `total_tokens` is computed
    /// from the input and output counts.
    pub fn new(model_id: &str, input_tokens: u64, output_tokens: u64, total_tokens: u64) -> Self {
        let pricing = pricing_for(model_id);
        let input_cost = Usd::from_nanos(input_tokens.saturating_mul(pricing.input));
        let output_cost = Usd::from_nanos(output_tokens.saturating_mul(pricing.output));
        let total_tokens = if total_tokens == 0 {
            input_tokens + output_tokens
        } else {
            total_tokens
        };
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
        }
    }

    /// Prices provider-reported usage.
    pub fn for_usage(model_id: &str, usage: TokenUsage) -> Self {
        Self::new(model_id, usage.input_tokens, usage.output_tokens, 0)
    }

    /// Field-wise sum. Associative and commutative.
    #[must_use]
    pub fn add(self, other: CostBreakdown) -> CostBreakdown {
        CostBreakdown {
            input_tokens: self.input_tokens.saturating_add(other.input_tokens),
            output_tokens: self.output_tokens.saturating_add(other.output_tokens),
            total_tokens: self.total_tokens.saturating_add(other.total_tokens),
            input_cost: self.input_cost + other.input_cost,
            output_cost: self.output_cost + other.output_cost,
            total_cost: self.total_cost + other.total_cost,
        }
    }

    /// Returns `true` when no tokens were used.
    pub fn is_zero(&self) -> bool {
        *self == CostBreakdown::default()
    }
}

impl AddAssign for CostBreakdown {
    fn add_assign(&mut self, rhs: CostBreakdown) {
        *self = self.add(rhs);
    }
}

impl std::iter::Sum for CostBreakdown {
    fn sum<I: Iterator<Item = CostBreakdown>>(iter: I) -> Self {
        iter.fold(CostBreakdown::default(), CostBreakdown::add)
    }
}

impl<'a> std::iter::Sum<&'a CostBreakdown> for CostBreakdown {
    fn sum<I: Iterator<Item = &'a CostBreakdown>>(iter: I) -> Self {
        iter.copied().sum()
    }
}
