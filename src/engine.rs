//! Quota accounting engine: accumulates rewards against per-rule quota
//! trackings when transactions are recorded, reverses them on delete, and
//! lazily rolls trackings over when their refresh point has passed. Every
//! operation runs inside one database transaction.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;

use crate::db;
use crate::error::{AppError, AppResult};
use crate::models::{
    QuotaBasis, QuotaSnapshotRow, QuotaTracking, RewardRule, RuleOwner, TrackingScope,
    TransactionRecord,
};
use crate::refresh::{is_stale, next_refresh_time};
use crate::reward::{marginal_reward, reward};

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub transaction_date: NaiveDate,
    pub amount: Option<i64>,
    pub scheme_id: Option<i64>,
    pub payment_method_id: Option<i64>,
    pub note: Option<String>,
}

fn remaining_for(quota_limit: Option<f64>, used: f64, manual: f64) -> Option<f64> {
    quota_limit.map(|limit| (limit - (used + manual)).max(0.0))
}

/// Activity end date feeding the `Activity` refresh policy: only
/// scheme-owned rules have one.
fn activity_end_for(conn: &Connection, rule: &RewardRule) -> AppResult<Option<NaiveDate>> {
    match rule.owner {
        RuleOwner::Scheme(scheme_id) => Ok(db::scheme_activity_end(conn, scheme_id)?),
        RuleOwner::PaymentMethod(_) => Ok(None),
    }
}

/// If the tracking's refresh point has passed, reset it for the new period
/// before any delta is applied. The manual adjustment corrected the expired
/// period, so it resets to zero along with the accumulators.
fn rollover_if_stale(
    conn: &Connection,
    tracking: QuotaTracking,
    rule: &RewardRule,
    activity_end: Option<NaiveDate>,
    now: DateTime<Utc>,
) -> AppResult<QuotaTracking> {
    if !is_stale(tracking.next_refresh_at, now) {
        return Ok(tracking);
    }

    let remaining = remaining_for(rule.quota_limit, 0.0, 0.0);
    let next = next_refresh_time(rule.refresh, activity_end, now);
    db::rollover_tracking(conn, tracking.id, remaining, next, now)?;

    Ok(QuotaTracking {
        used_quota: 0.0,
        current_amount: 0.0,
        manual_adjustment: 0.0,
        remaining_quota: remaining,
        last_refresh_at: Some(now),
        next_refresh_at: next,
        ..tracking
    })
}

/// Accumulates one transaction amount into one rule's tracking (§ apply).
fn accumulate_rule(
    conn: &Connection,
    rule: &RewardRule,
    scope: TrackingScope,
    amount: i64,
    now: DateTime<Utc>,
) -> AppResult<()> {
    let activity_end = activity_end_for(conn, rule)?;
    let tracking = match db::find_tracking(conn, scope, rule.id)? {
        Some(t) => Some(rollover_if_stale(conn, t, rule, activity_end, now)?),
        None => None,
    };

    let prior_amount = tracking.as_ref().map_or(0.0, |t| t.current_amount);
    let prior_used = tracking.as_ref().map_or(0.0, |t| t.used_quota);
    let manual = tracking.as_ref().map_or(0.0, |t| t.manual_adjustment);

    let delta = match rule.basis {
        QuotaBasis::Statement => {
            marginal_reward(prior_amount, amount as f64, rule.percentage, rule.method)
        }
        QuotaBasis::Transaction => reward(amount as f64, rule.percentage, rule.method),
    };

    let new_used = prior_used + delta;
    let new_amount = prior_amount + amount as f64;
    let remaining = remaining_for(rule.quota_limit, new_used, manual);

    match tracking {
        Some(t) => db::update_tracking_amounts(conn, t.id, new_used, new_amount, remaining)?,
        None => {
            let next = next_refresh_time(rule.refresh, activity_end, now);
            db::insert_tracking(conn, scope, rule.id, new_used, new_amount, 0.0, remaining, next)?;
        }
    }
    Ok(())
}

/// Reverses one transaction amount out of one rule's tracking (§ rollback).
/// A missing tracking row means nothing was ever accumulated; skip silently.
fn rollback_rule(
    conn: &Connection,
    rule: &RewardRule,
    scope: TrackingScope,
    amount: i64,
    now: DateTime<Utc>,
) -> AppResult<()> {
    let Some(tracking) = db::find_tracking(conn, scope, rule.id)? else {
        return Ok(());
    };
    let activity_end = activity_end_for(conn, rule)?;
    let tracking = rollover_if_stale(conn, tracking, rule, activity_end, now)?;

    let new_amount = (tracking.current_amount - amount as f64).max(0.0);

    // Statement basis: the reward attributable to the removed amount given
    // the remaining total, recomputed from current totals rather than
    // subtracting a cached delta (rounding is not associative).
    let rollback = match rule.basis {
        QuotaBasis::Statement => {
            marginal_reward(new_amount, amount as f64, rule.percentage, rule.method)
        }
        QuotaBasis::Transaction => reward(amount as f64, rule.percentage, rule.method),
    };

    let new_used = (tracking.used_quota - rollback).max(0.0);
    let remaining = remaining_for(rule.quota_limit, new_used, tracking.manual_adjustment);
    db::update_tracking_amounts(conn, tracking.id, new_used, new_amount, remaining)?;
    Ok(())
}

/// Records a transaction and accumulates its reward against every rule of
/// the referenced scheme and/or payment method. The scheme's rules and the
/// payment method's rules are independent sets; a scheme transaction that
/// also used a payment method tracks the method id on the scheme-scoped
/// rows without touching the method's own trackings.
pub fn apply_transaction(
    conn: &mut Connection,
    input: &NewTransaction,
    now: DateTime<Utc>,
) -> AppResult<TransactionRecord> {
    let tx = conn.transaction()?;

    if let Some(scheme_id) = input.scheme_id {
        if !db::scheme_exists(&tx, scheme_id)? {
            return Err(AppError::Validation(format!("unknown scheme id {scheme_id}")));
        }
    }
    if let Some(pm_id) = input.payment_method_id {
        if !db::payment_method_exists(&tx, pm_id)? {
            return Err(AppError::Validation(format!(
                "unknown payment method id {pm_id}"
            )));
        }
    }

    let record = db::insert_transaction(
        &tx,
        input.transaction_date,
        input.amount,
        input.scheme_id,
        input.payment_method_id,
        input.note.as_deref(),
        now,
    )?;

    if let Some(amount) = input.amount {
        if let Some(scheme_id) = input.scheme_id {
            let scope = TrackingScope::Scheme {
                scheme_id,
                payment_method_id: input.payment_method_id,
            };
            for rule in db::rules_for_scheme(&tx, scheme_id)? {
                accumulate_rule(&tx, &rule, scope, amount, now)?;
            }
        }
        if let Some(payment_method_id) = input.payment_method_id {
            let scope = TrackingScope::PaymentMethod { payment_method_id };
            for rule in db::rules_for_payment_method(&tx, payment_method_id)? {
                accumulate_rule(&tx, &rule, scope, amount, now)?;
            }
        }
    }

    tx.commit()?;
    Ok(record)
}

/// Deletes a transaction and reverses its accumulation, mirroring
/// [`apply_transaction`] with the removed amount and scope.
pub fn rollback_transaction(
    conn: &mut Connection,
    transaction_id: i64,
    now: DateTime<Utc>,
) -> AppResult<()> {
    let tx = conn.transaction()?;

    let record = db::get_transaction(&tx, transaction_id)?
        .ok_or_else(|| AppError::NotFound(format!("transaction {transaction_id}")))?;

    if let Some(amount) = record.amount {
        if let Some(scheme_id) = record.scheme_id {
            let scope = TrackingScope::Scheme {
                scheme_id,
                payment_method_id: record.payment_method_id,
            };
            for rule in db::rules_for_scheme(&tx, scheme_id)? {
                rollback_rule(&tx, &rule, scope, amount, now)?;
            }
        }
        if let Some(payment_method_id) = record.payment_method_id {
            let scope = TrackingScope::PaymentMethod { payment_method_id };
            for rule in db::rules_for_payment_method(&tx, payment_method_id)? {
                rollback_rule(&tx, &rule, scope, amount, now)?;
            }
        }
    }

    db::delete_transaction(&tx, transaction_id)?;
    tx.commit()?;
    Ok(())
}

/// Sets (or clears, with None) the absolute manual adjustment on a
/// (scope, rule) tracking and recomputes the remaining quota from the
/// current used amount. Creates the tracking lazily when none exists.
pub fn set_manual_adjustment(
    conn: &mut Connection,
    scope: TrackingScope,
    rule_id: i64,
    value: Option<f64>,
    now: DateTime<Utc>,
) -> AppResult<()> {
    let tx = conn.transaction()?;

    let rule = db::get_rule(&tx, rule_id)?
        .ok_or_else(|| AppError::NotFound(format!("reward rule {rule_id}")))?;

    let owner_matches = match (scope, rule.owner) {
        (TrackingScope::Scheme { scheme_id, .. }, RuleOwner::Scheme(owner)) => scheme_id == owner,
        (
            TrackingScope::PaymentMethod { payment_method_id },
            RuleOwner::PaymentMethod(owner),
        ) => payment_method_id == owner,
        _ => false,
    };
    if !owner_matches {
        return Err(AppError::Validation(format!(
            "reward rule {rule_id} does not belong to the given scope"
        )));
    }

    let adjustment = value.unwrap_or(0.0);
    match db::find_tracking(&tx, scope, rule_id)? {
        Some(t) => {
            let remaining = remaining_for(rule.quota_limit, t.used_quota, adjustment);
            db::update_tracking_adjustment(&tx, t.id, adjustment, remaining)?;
        }
        None => {
            let activity_end = activity_end_for(&tx, &rule)?;
            let next = next_refresh_time(rule.refresh, activity_end, now);
            let remaining = remaining_for(rule.quota_limit, 0.0, adjustment);
            db::insert_tracking(&tx, scope, rule_id, 0.0, 0.0, adjustment, remaining, next)?;
        }
    }

    tx.commit()?;
    Ok(())
}

/// Rolls over every stale tracking in one transaction. Either all scheduled
/// rollovers happen or none do.
fn refresh_sweep(conn: &mut Connection, now: DateTime<Utc>) -> AppResult<()> {
    let tx = conn.transaction()?;

    for tracking in db::trackings_with_refresh(&tx)? {
        if !is_stale(tracking.next_refresh_at, now) {
            continue;
        }
        // Rule may have been deleted out from under the tracking; cascade
        // normally removes the row, so just skip.
        let Some(rule) = db::get_rule(&tx, tracking.rule_id)? else {
            continue;
        };
        let activity_end = activity_end_for(&tx, &rule)?;
        let remaining = remaining_for(rule.quota_limit, 0.0, 0.0);
        let next = next_refresh_time(rule.refresh, activity_end, now);
        db::rollover_tracking(&tx, tracking.id, remaining, next, now)?;
    }

    tx.commit()?;
    Ok(())
}

fn scope_name(conn: &Connection, scope: TrackingScope) -> AppResult<String> {
    match scope {
        TrackingScope::Scheme {
            scheme_id,
            payment_method_id,
        } => {
            let scheme = db::scheme_name(conn, scheme_id)?
                .unwrap_or_else(|| format!("scheme {scheme_id}"));
            match payment_method_id {
                Some(pm_id) => {
                    let pm = db::payment_method_name(conn, pm_id)?
                        .unwrap_or_else(|| format!("payment method {pm_id}"));
                    Ok(format!("{scheme}-{pm}"))
                }
                None => Ok(scheme),
            }
        }
        TrackingScope::PaymentMethod { payment_method_id } => {
            Ok(db::payment_method_name(conn, payment_method_id)?
                .unwrap_or_else(|| format!("payment method {payment_method_id}")))
        }
    }
}

/// Current quota state across all trackings. Stale trackings are rolled
/// over first, so a reader never sees a tracking whose refresh point has
/// passed. A sweep failure is logged and the read proceeds on pre-sweep
/// data; staleness is preferred over a failed read.
pub fn quota_snapshot(conn: &mut Connection, now: DateTime<Utc>) -> AppResult<Vec<QuotaSnapshotRow>> {
    if let Err(err) = refresh_sweep(conn, now) {
        tracing::error!(error = %err, "quota refresh sweep failed, returning pre-sweep state");
    }

    let mut rows = Vec::new();
    for tracking in db::all_trackings(conn)? {
        let Some(rule) = db::get_rule(conn, tracking.rule_id)? else {
            continue;
        };
        let reference_amount = match tracking.remaining_quota {
            Some(remaining) if rule.percentage > 0.0 => Some(remaining / rule.percentage * 100.0),
            _ => None,
        };
        rows.push(QuotaSnapshotRow {
            name: scope_name(conn, tracking.scope)?,
            scheme_id: tracking.scope.scheme_id(),
            payment_method_id: tracking.scope.payment_method_id(),
            rule_id: rule.id,
            percentage: rule.percentage,
            used_quota: tracking.used_quota,
            manual_adjustment: tracking.manual_adjustment,
            remaining_quota: tracking.remaining_quota,
            current_amount: tracking.current_amount,
            reference_amount,
            next_refresh_at: tracking.next_refresh_at,
        });
    }
    Ok(rows)
}

/// Best-effort resynchronization of a rule's tracking from the raw
/// transactions in the current window, used after a rule's percentage,
/// method, or basis is edited. The manual adjustment is preserved.
pub fn recompute_rule_tracking(
    conn: &mut Connection,
    rule_id: i64,
    now: DateTime<Utc>,
) -> AppResult<()> {
    let tx = conn.transaction()?;

    let rule = db::get_rule(&tx, rule_id)?
        .ok_or_else(|| AppError::NotFound(format!("reward rule {rule_id}")))?;

    let scope = match rule.owner {
        RuleOwner::Scheme(scheme_id) => TrackingScope::Scheme {
            scheme_id,
            payment_method_id: None,
        },
        RuleOwner::PaymentMethod(payment_method_id) => {
            TrackingScope::PaymentMethod { payment_method_id }
        }
    };
    let tracking = db::find_tracking(&tx, scope, rule_id)?;

    let window_start = tracking.as_ref().and_then(|t| t.last_refresh_at);
    let window_end = tracking
        .as_ref()
        .and_then(|t| t.next_refresh_at)
        .unwrap_or(now);
    let amounts = db::transaction_amounts_in_window(&tx, rule.owner, window_start, window_end)?;

    let current_amount: f64 = amounts.iter().map(|&a| a as f64).sum();
    let used_quota = match rule.basis {
        QuotaBasis::Transaction => amounts
            .iter()
            .map(|&a| reward(a as f64, rule.percentage, rule.method))
            .sum(),
        QuotaBasis::Statement => reward(current_amount, rule.percentage, rule.method),
    };

    let manual = tracking.as_ref().map_or(0.0, |t| t.manual_adjustment);
    let remaining = remaining_for(rule.quota_limit, used_quota, manual);

    match tracking {
        Some(t) => db::update_tracking_amounts(&tx, t.id, used_quota, current_amount, remaining)?,
        None => {
            let activity_end = activity_end_for(&tx, &rule)?;
            let next = next_refresh_time(rule.refresh, activity_end, now);
            db::insert_tracking(
                &tx,
                scope,
                rule_id,
                used_quota,
                current_amount,
                0.0,
                remaining,
                next,
            )?;
        }
    }

    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_db;
    use crate::models::CalculationMethod::{Floor, Round};
    use crate::models::QuotaBasis::{Statement, Transaction};
    use crate::models::RefreshPolicy;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn new_tx(amount: i64, scheme_id: Option<i64>, payment_method_id: Option<i64>) -> NewTransaction {
        NewTransaction {
            transaction_date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            amount: Some(amount),
            scheme_id,
            payment_method_id,
            note: None,
        }
    }

    fn scheme_with_rule(
        conn: &Connection,
        basis: QuotaBasis,
        limit: Option<f64>,
        refresh: RefreshPolicy,
    ) -> (i64, i64) {
        let s = db::add_scheme(conn, "Cashback", None).unwrap();
        let r = db::add_rule(conn, RuleOwner::Scheme(s), 2.7, Round, limit, basis, refresh, 0)
            .unwrap();
        (s, r)
    }

    fn scheme_tracking(conn: &Connection, scheme_id: i64, rule_id: i64) -> QuotaTracking {
        let scope = TrackingScope::Scheme {
            scheme_id,
            payment_method_id: None,
        };
        db::find_tracking(conn, scope, rule_id).unwrap().unwrap()
    }

    #[test]
    fn test_apply_transaction_basis_scenario() {
        let mut conn = test_db();
        let (s, r) = scheme_with_rule(&conn, Transaction, Some(500.0), RefreshPolicy::None);
        let now = at(2025, 3, 10);

        // 1000 at 2.7% round -> 27
        apply_transaction(&mut conn, &new_tx(1000, Some(s), None), now).unwrap();
        let t = scheme_tracking(&conn, s, r);
        assert_eq!(t.used_quota, 27.0);
        assert_eq!(t.current_amount, 1000.0);
        assert_eq!(t.remaining_quota, Some(473.0));

        // 500 at 2.7% = 13.5, rounds half-up to 14
        apply_transaction(&mut conn, &new_tx(500, Some(s), None), now).unwrap();
        let t = scheme_tracking(&conn, s, r);
        assert_eq!(t.used_quota, 41.0);
        assert_eq!(t.current_amount, 1500.0);
        assert_eq!(t.remaining_quota, Some(459.0));
    }

    #[test]
    fn test_apply_statement_basis_scenario() {
        let mut conn = test_db();
        let (s, r) = scheme_with_rule(&conn, Statement, Some(500.0), RefreshPolicy::None);
        let now = at(2025, 3, 10);

        apply_transaction(&mut conn, &new_tx(1000, Some(s), None), now).unwrap();
        let t = scheme_tracking(&conn, s, r);
        assert_eq!(t.used_quota, 27.0);
        assert_eq!(t.current_amount, 1000.0);

        // marginal: round(1500 * 2.7%) - round(1000 * 2.7%) = 41 - 27 = 14
        apply_transaction(&mut conn, &new_tx(500, Some(s), None), now).unwrap();
        let t = scheme_tracking(&conn, s, r);
        assert_eq!(t.used_quota, 41.0);
        assert_eq!(t.current_amount, 1500.0);
        assert_eq!(t.remaining_quota, Some(459.0));
    }

    #[test]
    fn test_apply_rejects_unknown_scheme() {
        let mut conn = test_db();
        let err = apply_transaction(&mut conn, &new_tx(100, Some(42), None), at(2025, 3, 1));
        assert!(matches!(err, Err(AppError::Validation(_))));
        // Nothing persisted.
        assert!(db::list_transactions(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_apply_rejects_unknown_payment_method() {
        let mut conn = test_db();
        let err = apply_transaction(&mut conn, &new_tx(100, None, Some(42)), at(2025, 3, 1));
        assert!(matches!(err, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_apply_without_amount_records_only() {
        let mut conn = test_db();
        let (s, r) = scheme_with_rule(&conn, Transaction, Some(500.0), RefreshPolicy::None);
        let input = NewTransaction {
            amount: None,
            ..new_tx(0, Some(s), None)
        };
        apply_transaction(&mut conn, &input, at(2025, 3, 1)).unwrap();

        let scope = TrackingScope::Scheme {
            scheme_id: s,
            payment_method_id: None,
        };
        assert!(db::find_tracking(&conn, scope, r).unwrap().is_none());
        assert_eq!(db::list_transactions(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_composite_rules_accumulate_independently() {
        let mut conn = test_db();
        let s = db::add_scheme(&conn, "Composite", None).unwrap();
        let r1 = db::add_rule(&conn, RuleOwner::Scheme(s), 0.3, Round, None, Transaction, RefreshPolicy::None, 0)
            .unwrap();
        let r2 = db::add_rule(&conn, RuleOwner::Scheme(s), 2.7, Round, Some(500.0), Transaction, RefreshPolicy::None, 1)
            .unwrap();

        apply_transaction(&mut conn, &new_tx(1000, Some(s), None), at(2025, 3, 1)).unwrap();

        let t1 = scheme_tracking(&conn, s, r1);
        let t2 = scheme_tracking(&conn, s, r2);
        assert_eq!(t1.used_quota, 3.0);
        assert_eq!(t1.remaining_quota, None);
        assert_eq!(t2.used_quota, 27.0);
        assert_eq!(t2.remaining_quota, Some(473.0));
    }

    #[test]
    fn test_scheme_and_payment_rule_sets_are_independent() {
        let mut conn = test_db();
        let s = db::add_scheme(&conn, "S", None).unwrap();
        let p = db::add_payment_method(&conn, "P").unwrap();
        let sr = db::add_rule(&conn, RuleOwner::Scheme(s), 2.7, Round, None, Transaction, RefreshPolicy::None, 0)
            .unwrap();
        let pr = db::add_rule(&conn, RuleOwner::PaymentMethod(p), 1.0, Round, None, Transaction, RefreshPolicy::None, 0)
            .unwrap();

        apply_transaction(&mut conn, &new_tx(1000, Some(s), Some(p)), at(2025, 3, 1)).unwrap();

        // Scheme tracking carries the incidental payment method id.
        let scheme_scope = TrackingScope::Scheme {
            scheme_id: s,
            payment_method_id: Some(p),
        };
        let st = db::find_tracking(&conn, scheme_scope, sr).unwrap().unwrap();
        assert_eq!(st.used_quota, 27.0);

        // Payment tracking is its own row with its own rule.
        let pm_scope = TrackingScope::PaymentMethod { payment_method_id: p };
        let pt = db::find_tracking(&conn, pm_scope, pr).unwrap().unwrap();
        assert_eq!(pt.used_quota, 10.0);
    }

    #[test]
    fn test_apply_then_rollback_restores_state_transaction_basis() {
        let mut conn = test_db();
        let (s, r) = scheme_with_rule(&conn, Transaction, Some(500.0), RefreshPolicy::None);
        let now = at(2025, 3, 10);

        apply_transaction(&mut conn, &new_tx(1000, Some(s), None), now).unwrap();
        let before = scheme_tracking(&conn, s, r);

        let tx = apply_transaction(&mut conn, &new_tx(777, Some(s), None), now).unwrap();
        rollback_transaction(&mut conn, tx.id, now).unwrap();

        let after = scheme_tracking(&conn, s, r);
        assert_eq!(after.used_quota, before.used_quota);
        assert_eq!(after.current_amount, before.current_amount);
        assert_eq!(after.remaining_quota, before.remaining_quota);
        assert!(db::get_transaction(&conn, tx.id).unwrap().is_none());
    }

    #[test]
    fn test_apply_then_rollback_restores_state_statement_basis() {
        let mut conn = test_db();
        let (s, r) = scheme_with_rule(&conn, Statement, Some(500.0), RefreshPolicy::None);
        let now = at(2025, 3, 10);

        apply_transaction(&mut conn, &new_tx(1000, Some(s), None), now).unwrap();
        let before = scheme_tracking(&conn, s, r);

        // 500 crosses the half-up boundary (40.5); the marginal rollback
        // must still restore the exact prior state.
        let tx = apply_transaction(&mut conn, &new_tx(500, Some(s), None), now).unwrap();
        rollback_transaction(&mut conn, tx.id, now).unwrap();

        let after = scheme_tracking(&conn, s, r);
        assert_eq!(after.used_quota, before.used_quota);
        assert_eq!(after.current_amount, before.current_amount);
        assert_eq!(after.remaining_quota, before.remaining_quota);
    }

    #[test]
    fn test_rollback_clamps_at_zero() {
        let mut conn = test_db();
        let (s, r) = scheme_with_rule(&conn, Transaction, Some(500.0), RefreshPolicy::None);
        let now = at(2025, 3, 10);

        let tx = apply_transaction(&mut conn, &new_tx(1000, Some(s), None), now).unwrap();
        // Drain the tracking behind the engine's back, then roll back.
        let t = scheme_tracking(&conn, s, r);
        db::update_tracking_amounts(&conn, t.id, 5.0, 100.0, Some(495.0)).unwrap();

        rollback_transaction(&mut conn, tx.id, now).unwrap();
        let t = scheme_tracking(&conn, s, r);
        assert_eq!(t.used_quota, 0.0);
        assert_eq!(t.current_amount, 0.0);
    }

    #[test]
    fn test_rollback_missing_transaction_is_not_found() {
        let mut conn = test_db();
        let err = rollback_transaction(&mut conn, 999, at(2025, 3, 1));
        assert!(matches!(err, Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_rollback_without_tracking_skips_silently() {
        let mut conn = test_db();
        let s = db::add_scheme(&conn, "S", None).unwrap();
        let now = at(2025, 3, 1);
        // Transaction recorded before any rule existed; no tracking anywhere.
        let tx = apply_transaction(&mut conn, &new_tx(1000, Some(s), None), now).unwrap();
        db::add_rule(&conn, RuleOwner::Scheme(s), 2.7, Round, None, Transaction, RefreshPolicy::None, 0)
            .unwrap();

        rollback_transaction(&mut conn, tx.id, now).unwrap();
        assert!(db::get_transaction(&conn, tx.id).unwrap().is_none());
    }

    #[test]
    fn test_stale_tracking_rolls_over_before_apply() {
        let mut conn = test_db();
        let (s, r) =
            scheme_with_rule(&conn, Transaction, Some(500.0), RefreshPolicy::Monthly { day: 15 });

        // Accumulate in March, before the refresh day.
        apply_transaction(&mut conn, &new_tx(1000, Some(s), None), at(2025, 3, 10)).unwrap();
        let t = scheme_tracking(&conn, s, r);
        assert_eq!(t.used_quota, 27.0);
        assert_eq!(t.next_refresh_at, Some(Utc.with_ymd_and_hms(2025, 3, 15, 0, 0, 0).unwrap()));

        // Next apply lands after the refresh point: period resets first.
        apply_transaction(&mut conn, &new_tx(500, Some(s), None), at(2025, 3, 20)).unwrap();
        let t = scheme_tracking(&conn, s, r);
        assert_eq!(t.used_quota, 14.0);
        assert_eq!(t.current_amount, 500.0);
        assert_eq!(t.remaining_quota, Some(486.0));
        assert_eq!(t.next_refresh_at, Some(Utc.with_ymd_and_hms(2025, 4, 15, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_manual_adjustment_composes_with_accumulation() {
        let mut conn = test_db();
        let s = db::add_scheme(&conn, "S", None).unwrap();
        let r = db::add_rule(&conn, RuleOwner::Scheme(s), 5.0, Floor, Some(100.0), Transaction, RefreshPolicy::None, 0)
            .unwrap();
        let scope = TrackingScope::Scheme {
            scheme_id: s,
            payment_method_id: None,
        };
        let now = at(2025, 3, 1);

        // used 30 via a 600 spend at 5% floor.
        apply_transaction(&mut conn, &new_tx(600, Some(s), None), now).unwrap();
        set_manual_adjustment(&mut conn, scope, r, Some(10.0), now).unwrap();
        let t = scheme_tracking(&conn, s, r);
        assert_eq!(t.used_quota, 30.0);
        assert_eq!(t.manual_adjustment, 10.0);
        assert_eq!(t.remaining_quota, Some(60.0));

        // A further 100 spend adds reward 5; adjustment still composes.
        apply_transaction(&mut conn, &new_tx(100, Some(s), None), now).unwrap();
        let t = scheme_tracking(&conn, s, r);
        assert_eq!(t.used_quota, 35.0);
        assert_eq!(t.remaining_quota, Some(55.0));
    }

    #[test]
    fn test_manual_adjustment_creates_tracking_lazily() {
        let mut conn = test_db();
        let (s, r) =
            scheme_with_rule(&conn, Transaction, Some(500.0), RefreshPolicy::Monthly { day: 5 });
        let scope = TrackingScope::Scheme {
            scheme_id: s,
            payment_method_id: None,
        };
        let now = at(2025, 3, 1);

        set_manual_adjustment(&mut conn, scope, r, Some(20.0), now).unwrap();
        let t = scheme_tracking(&conn, s, r);
        assert_eq!(t.used_quota, 0.0);
        assert_eq!(t.manual_adjustment, 20.0);
        assert_eq!(t.remaining_quota, Some(480.0));
        assert_eq!(t.next_refresh_at, Some(Utc.with_ymd_and_hms(2025, 3, 5, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_manual_adjustment_none_clears() {
        let mut conn = test_db();
        let (s, r) = scheme_with_rule(&conn, Transaction, Some(500.0), RefreshPolicy::None);
        let scope = TrackingScope::Scheme {
            scheme_id: s,
            payment_method_id: None,
        };
        let now = at(2025, 3, 1);

        apply_transaction(&mut conn, &new_tx(1000, Some(s), None), now).unwrap();
        set_manual_adjustment(&mut conn, scope, r, Some(50.0), now).unwrap();
        set_manual_adjustment(&mut conn, scope, r, None, now).unwrap();

        let t = scheme_tracking(&conn, s, r);
        assert_eq!(t.manual_adjustment, 0.0);
        assert_eq!(t.remaining_quota, Some(473.0));
    }

    #[test]
    fn test_manual_adjustment_wrong_scope_rejected() {
        let mut conn = test_db();
        let (_, r) = scheme_with_rule(&conn, Transaction, Some(500.0), RefreshPolicy::None);
        let p = db::add_payment_method(&conn, "P").unwrap();

        let err = set_manual_adjustment(
            &mut conn,
            TrackingScope::PaymentMethod { payment_method_id: p },
            r,
            Some(1.0),
            at(2025, 3, 1),
        );
        assert!(matches!(err, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_snapshot_sweeps_stale_trackings() {
        let mut conn = test_db();
        let (s, _) =
            scheme_with_rule(&conn, Transaction, Some(500.0), RefreshPolicy::Monthly { day: 15 });

        apply_transaction(&mut conn, &new_tx(1000, Some(s), None), at(2025, 3, 10)).unwrap();

        // Read lands past the refresh point: no stale numbers visible.
        let rows = quota_snapshot(&mut conn, at(2025, 3, 20)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].used_quota, 0.0);
        assert_eq!(rows[0].current_amount, 0.0);
        assert_eq!(rows[0].remaining_quota, Some(500.0));
        assert_eq!(
            rows[0].next_refresh_at,
            Some(Utc.with_ymd_and_hms(2025, 4, 15, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_snapshot_rollover_resets_manual_adjustment() {
        let mut conn = test_db();
        let (s, r) =
            scheme_with_rule(&conn, Transaction, Some(500.0), RefreshPolicy::Monthly { day: 15 });
        let scope = TrackingScope::Scheme {
            scheme_id: s,
            payment_method_id: None,
        };

        apply_transaction(&mut conn, &new_tx(1000, Some(s), None), at(2025, 3, 10)).unwrap();
        set_manual_adjustment(&mut conn, scope, r, Some(30.0), at(2025, 3, 10)).unwrap();

        let rows = quota_snapshot(&mut conn, at(2025, 3, 20)).unwrap();
        // The adjustment corrected the expired period: gone after rollover.
        assert_eq!(rows[0].manual_adjustment, 0.0);
        assert_eq!(rows[0].remaining_quota, Some(500.0));
    }

    #[test]
    fn test_snapshot_reference_amount() {
        let mut conn = test_db();
        let (s, _) = scheme_with_rule(&conn, Transaction, Some(500.0), RefreshPolicy::None);
        let now = at(2025, 3, 10);

        apply_transaction(&mut conn, &new_tx(1000, Some(s), None), now).unwrap();
        let rows = quota_snapshot(&mut conn, now).unwrap();
        // remaining 473 at 2.7% -> 473 / 2.7 * 100 spend headroom.
        let expected = 473.0 / 2.7 * 100.0;
        assert!((rows[0].reference_amount.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_unlimited_rule_has_no_reference() {
        let mut conn = test_db();
        let (s, _) = scheme_with_rule(&conn, Transaction, None, RefreshPolicy::None);
        let now = at(2025, 3, 10);

        apply_transaction(&mut conn, &new_tx(1000, Some(s), None), now).unwrap();
        let rows = quota_snapshot(&mut conn, now).unwrap();
        assert_eq!(rows[0].remaining_quota, None);
        assert_eq!(rows[0].reference_amount, None);
    }

    #[test]
    fn test_date_refresh_is_terminal_after_rollover() {
        let mut conn = test_db();
        let on = NaiveDate::from_ymd_opt(2025, 4, 1).unwrap();
        let (s, r) =
            scheme_with_rule(&conn, Transaction, Some(500.0), RefreshPolicy::Date { on });

        apply_transaction(&mut conn, &new_tx(1000, Some(s), None), at(2025, 3, 10)).unwrap();
        let t = scheme_tracking(&conn, s, r);
        assert!(t.next_refresh_at.is_some());

        // Past the one-shot date: rollover happens once, then no further
        // refresh is scheduled.
        let rows = quota_snapshot(&mut conn, at(2025, 4, 2)).unwrap();
        assert_eq!(rows[0].used_quota, 0.0);
        assert_eq!(rows[0].next_refresh_at, None);
    }

    #[test]
    fn test_activity_refresh_uses_scheme_end_date() {
        let mut conn = test_db();
        let end = NaiveDate::from_ymd_opt(2025, 6, 30).unwrap();
        let s = db::add_scheme(&conn, "Promo", Some(end)).unwrap();
        let r = db::add_rule(&conn, RuleOwner::Scheme(s), 2.7, Round, Some(500.0), Transaction, RefreshPolicy::Activity, 0)
            .unwrap();

        apply_transaction(&mut conn, &new_tx(1000, Some(s), None), at(2025, 3, 10)).unwrap();
        let t = scheme_tracking(&conn, s, r);
        assert_eq!(t.next_refresh_at, Some(Utc.with_ymd_and_hms(2025, 6, 30, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_recompute_resyncs_drifted_tracking() {
        let mut conn = test_db();
        let (s, r) = scheme_with_rule(&conn, Transaction, Some(500.0), RefreshPolicy::None);
        let now = at(2025, 3, 10);

        apply_transaction(&mut conn, &new_tx(1000, Some(s), None), now).unwrap();
        apply_transaction(&mut conn, &new_tx(500, Some(s), None), now).unwrap();

        // Edit the rule to 5% floor; the tracking still holds 2.7% numbers.
        db::update_rule_calculation(&conn, r, 5.0, Floor, Some(500.0), Transaction).unwrap();
        recompute_rule_tracking(&mut conn, r, now).unwrap();

        let t = scheme_tracking(&conn, s, r);
        assert_eq!(t.current_amount, 1500.0);
        assert_eq!(t.used_quota, 75.0); // floor(50) + floor(25)
        assert_eq!(t.remaining_quota, Some(425.0));
    }

    #[test]
    fn test_recompute_statement_basis_uses_window_total() {
        let mut conn = test_db();
        let (s, r) = scheme_with_rule(&conn, Transaction, Some(500.0), RefreshPolicy::None);
        let now = at(2025, 3, 10);

        apply_transaction(&mut conn, &new_tx(500, Some(s), None), now).unwrap();
        apply_transaction(&mut conn, &new_tx(500, Some(s), None), now).unwrap();
        // Per-transaction accumulation rounded 13.5 up twice: used 28.

        db::update_rule_calculation(&conn, r, 2.7, Round, Some(500.0), Statement).unwrap();
        recompute_rule_tracking(&mut conn, r, now).unwrap();

        let t = scheme_tracking(&conn, s, r);
        // Statement basis rewards the window total: round(27.0) = 27.
        assert_eq!(t.used_quota, 27.0);
    }

    #[test]
    fn test_recompute_preserves_manual_adjustment() {
        let mut conn = test_db();
        let (s, r) = scheme_with_rule(&conn, Transaction, Some(500.0), RefreshPolicy::None);
        let scope = TrackingScope::Scheme {
            scheme_id: s,
            payment_method_id: None,
        };
        let now = at(2025, 3, 10);

        apply_transaction(&mut conn, &new_tx(1000, Some(s), None), now).unwrap();
        set_manual_adjustment(&mut conn, scope, r, Some(10.0), now).unwrap();
        recompute_rule_tracking(&mut conn, r, now).unwrap();

        let t = scheme_tracking(&conn, s, r);
        assert_eq!(t.manual_adjustment, 10.0);
        assert_eq!(t.remaining_quota, Some(463.0));
    }

    #[test]
    fn test_remaining_quota_invariant_after_each_operation() {
        let mut conn = test_db();
        let (s, r) = scheme_with_rule(&conn, Transaction, Some(100.0), RefreshPolicy::None);
        let scope = TrackingScope::Scheme {
            scheme_id: s,
            payment_method_id: None,
        };
        let now = at(2025, 3, 10);

        let check = |conn: &Connection| {
            let t = db::find_tracking(conn, scope, r).unwrap().unwrap();
            let expected = (100.0 - (t.used_quota + t.manual_adjustment)).max(0.0);
            assert_eq!(t.remaining_quota, Some(expected));
        };

        apply_transaction(&mut conn, &new_tx(1000, Some(s), None), now).unwrap();
        check(&conn);
        set_manual_adjustment(&mut conn, scope, r, Some(40.0), now).unwrap();
        check(&conn);
        // Push past the limit: remaining clamps at zero.
        apply_transaction(&mut conn, &new_tx(2000, Some(s), None), now).unwrap();
        check(&conn);
        let t = db::find_tracking(&conn, scope, r).unwrap().unwrap();
        assert_eq!(t.remaining_quota, Some(0.0));
    }
}
