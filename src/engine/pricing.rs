//! Pricing decision engine.
//!
//! Pure and deterministic: maps a listing's current price, its profit
//! bounds and the live competitor prices to an optional new price. All
//! arithmetic is exact `Decimal`.
//!
//! Branches, first match wins:
//! 1. Undercut-floor rescue: the cheapest rival is below our floor and a
//!    ceiling is set, so go to the ceiling.
//! 2. All competitors raised: every rival is above us, so ride up to one
//!    step below the cheapest rival (capped by the ceiling when set).
//! 3. Standard dampening: we are more than one step above the cheapest
//!    rival, so undercut it by one step if that stays above the floor.
//!
//! Whatever the branch, the result is clamped into `[floor, ceiling]`.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::types::{ChangeReason, SkipReason};

/// Everything the decision depends on. No hidden state.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingInput {
    pub current_price: Decimal,
    pub min_profit: Decimal,
    pub max_profit: Option<Decimal>,
    pub price_step: Decimal,
    pub competitor_prices: Vec<Decimal>,
    /// Second most recent recorded price, or the current price.
    pub previous_price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    UndercutFloorRescue,
    AllCompetitorsRaised,
    StandardDampening,
}

impl Branch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Branch::UndercutFloorRescue => "undercut_floor_rescue",
            Branch::AllCompetitorsRaised => "all_competitors_raised",
            Branch::StandardDampening => "standard_dampening",
        }
    }
}

/// Which post-processing clamp changed the branch result, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Clamp {
    Floor,
    Ceiling,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceDecision {
    pub new_price: Decimal,
    pub branch: Branch,
    pub reason: ChangeReason,
    pub clamped: Option<Clamp>,
    /// Signed move relative to the current price, in percent.
    pub change_pct: Decimal,
    /// Move exceeds the anomaly threshold. Logged, never blocked.
    pub anomalous: bool,
    /// The move lands back on the previously recorded price.
    pub reverts_previous: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Reprice(PriceDecision),
    Skip(SkipReason),
}

/// Aggregate view of the rival offers, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub competitors: usize,
    pub lowest: Decimal,
    pub highest: Decimal,
    pub average: Decimal,
    pub median: Decimal,
    pub spread: Decimal,
}

impl MarketSnapshot {
    pub fn from_prices(prices: &[Decimal]) -> Option<Self> {
        if prices.is_empty() {
            return None;
        }
        let mut sorted = prices.to_vec();
        sorted.sort();
        let lowest = sorted[0];
        let highest = sorted[sorted.len() - 1];
        let total: Decimal = sorted.iter().sum();
        Some(Self {
            competitors: sorted.len(),
            lowest,
            highest,
            average: (total / Decimal::from(sorted.len())).round_dp(2),
            median: sorted[sorted.len() / 2],
            spread: highest - lowest,
        })
    }
}

pub const DEFAULT_ANOMALY_THRESHOLD_PCT: Decimal = dec!(20);

/// Decide the next price for one listing.
pub fn decide(input: &PricingInput, anomaly_threshold_pct: Decimal) -> Decision {
    let Some(lowest) = input.competitor_prices.iter().copied().min() else {
        return Decision::Skip(SkipReason::NoCompetitors);
    };

    let current = input.current_price;
    let floor = input.min_profit;
    // A zero ceiling means "not configured".
    let ceiling = input.max_profit.filter(|c| *c > Decimal::ZERO);
    let step = if input.price_step > Decimal::ZERO {
        input.price_step
    } else {
        Decimal::ONE
    };

    let all_raised = input.competitor_prices.iter().all(|p| *p > current);

    let candidate = match ceiling {
        Some(ceiling) if lowest < floor => Some((ceiling, Branch::UndercutFloorRescue)),
        _ if all_raised => {
            let target = lowest - step;
            (target > current).then(|| (ceiling.map_or(target, |c| target.min(c)), Branch::AllCompetitorsRaised))
        }
        _ if current > lowest + step => {
            let target = lowest - step;
            (target >= floor).then_some((target, Branch::StandardDampening))
        }
        _ => None,
    };

    let Some((raw, branch)) = candidate else {
        return Decision::Skip(SkipReason::NoQualifyingBranch);
    };

    let (new_price, clamped) = clamp(raw, floor, ceiling);
    let change_pct = percent_change(current, new_price);

    Decision::Reprice(PriceDecision {
        new_price,
        branch,
        reason: ChangeReason::classify(current, new_price),
        clamped,
        change_pct,
        anomalous: change_pct.abs() > anomaly_threshold_pct,
        reverts_previous: new_price != current && new_price == input.previous_price,
    })
}

fn clamp(price: Decimal, floor: Decimal, ceiling: Option<Decimal>) -> (Decimal, Option<Clamp>) {
    let mut out = (price, None);
    if out.0 < floor {
        out = (floor, Some(Clamp::Floor));
    }
    if let Some(ceiling) = ceiling {
        if out.0 > ceiling {
            out = (ceiling, Some(Clamp::Ceiling));
        }
    }
    out
}

fn percent_change(from: Decimal, to: Decimal) -> Decimal {
    if from.is_zero() {
        return if to.is_zero() { Decimal::ZERO } else { dec!(100) };
    }
    ((to - from) / from * dec!(100)).round_dp(2)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
