use crate::models::CalculationMethod;

/// Reward earned on `amount` at `percentage`, rounded per `method`.
///
/// The raw `amount * percentage / 100` value is rounded as-is: a negative
/// amount produces a negative reward (floor pushes it further negative).
/// Accumulation paths only ever pass non-negative amounts; rollback
/// recomputes from current totals rather than negating a cached value.
pub fn reward(amount: f64, percentage: f64, method: CalculationMethod) -> f64 {
    let raw = amount * percentage / 100.0;
    match method {
        CalculationMethod::Round => raw.round(),
        CalculationMethod::Floor => raw.floor(),
        CalculationMethod::Ceil => raw.ceil(),
    }
}

/// Marginal reward for adding `delta` on top of `prior` under statement
/// basis: the reward is computed on the billing-cycle total, so one
/// transaction only credits the increase in the rounded cumulative reward.
/// This keeps the period total free of per-transaction rounding drift.
pub fn marginal_reward(prior: f64, delta: f64, percentage: f64, method: CalculationMethod) -> f64 {
    reward(prior + delta, percentage, method) - reward(prior, percentage, method)
}
