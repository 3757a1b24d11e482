use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result, Row};

use crate::models::{
    CalculationMethod, QuotaBasis, QuotaTracking, RefreshPolicy, RewardRule, RuleOwner,
    TrackingScope, TransactionListRow, TransactionRecord,
};

/// Creates tables on the given connection.
pub fn init_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schemes (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            name                TEXT NOT NULL,
            activity_end_date   TEXT,
            display_order       INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS payment_methods (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            name            TEXT NOT NULL,
            display_order   INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS reward_rules (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            scheme_id               INTEGER REFERENCES schemes(id) ON DELETE CASCADE,
            payment_method_id       INTEGER REFERENCES payment_methods(id) ON DELETE CASCADE,
            percentage              REAL NOT NULL,
            calculation_method      TEXT NOT NULL DEFAULT 'round',
            quota_limit             REAL,
            quota_calculation_basis TEXT NOT NULL DEFAULT 'transaction',
            quota_refresh_type      TEXT,
            quota_refresh_value     INTEGER,
            quota_refresh_date      TEXT,
            display_order           INTEGER NOT NULL DEFAULT 0,
            CHECK ((scheme_id IS NULL) <> (payment_method_id IS NULL))
        );
        CREATE TABLE IF NOT EXISTS quota_trackings (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            scheme_id           INTEGER REFERENCES schemes(id) ON DELETE CASCADE,
            payment_method_id   INTEGER REFERENCES payment_methods(id) ON DELETE CASCADE,
            rule_id             INTEGER NOT NULL REFERENCES reward_rules(id) ON DELETE CASCADE,
            used_quota          REAL NOT NULL DEFAULT 0,
            current_amount      REAL NOT NULL DEFAULT 0,
            manual_adjustment   REAL NOT NULL DEFAULT 0,
            remaining_quota     REAL,
            last_refresh_at     TEXT,
            next_refresh_at     TEXT
        );
        CREATE TABLE IF NOT EXISTS transactions (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_date    TEXT NOT NULL,
            amount              INTEGER,
            scheme_id           INTEGER REFERENCES schemes(id),
            payment_method_id   INTEGER REFERENCES payment_methods(id),
            note                TEXT,
            created_at          TEXT NOT NULL
        );",
    )?;
    Ok(())
}

/// Opens (or creates) the SQLite database file and ensures tables exist.
/// Path comes from QUOTA_TRACKER_DB, defaulting to quota_tracker.db.
pub fn init_db() -> Result<Connection> {
    let path =
        std::env::var("QUOTA_TRACKER_DB").unwrap_or_else(|_| "quota_tracker.db".to_string());
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    init_tables(&conn)?;
    Ok(conn)
}

// --- schemes / payment methods ---

pub fn add_scheme(
    conn: &Connection,
    name: &str,
    activity_end_date: Option<NaiveDate>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO schemes (name, activity_end_date) VALUES (?1, ?2)",
        params![name, activity_end_date],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn add_payment_method(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO payment_methods (name) VALUES (?1)",
        params![name],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn scheme_exists(conn: &Connection, id: i64) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT id FROM schemes WHERE id = ?1", params![id], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

pub fn payment_method_exists(conn: &Connection, id: i64) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT id FROM payment_methods WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn scheme_name(conn: &Connection, id: i64) -> Result<Option<String>> {
    conn.query_row("SELECT name FROM schemes WHERE id = ?1", params![id], |r| {
        r.get(0)
    })
    .optional()
}

pub fn payment_method_name(conn: &Connection, id: i64) -> Result<Option<String>> {
    conn.query_row(
        "SELECT name FROM payment_methods WHERE id = ?1",
        params![id],
        |r| r.get(0),
    )
    .optional()
}

pub fn scheme_activity_end(conn: &Connection, scheme_id: i64) -> Result<Option<NaiveDate>> {
    conn.query_row(
        "SELECT activity_end_date FROM schemes WHERE id = ?1",
        params![scheme_id],
        |r| r.get(0),
    )
}

// --- reward rules ---

fn refresh_to_columns(
    policy: RefreshPolicy,
) -> (Option<&'static str>, Option<i64>, Option<NaiveDate>) {
    match policy {
        RefreshPolicy::None => (None, None, None),
        RefreshPolicy::Monthly { day } => (Some("monthly"), Some(day as i64), None),
        RefreshPolicy::Date { on } => (Some("date"), None, Some(on)),
        RefreshPolicy::Activity => (Some("activity"), None, None),
    }
}

fn refresh_from_columns(
    kind: Option<String>,
    value: Option<i64>,
    date: Option<NaiveDate>,
) -> RefreshPolicy {
    match kind.as_deref() {
        Some("monthly") => RefreshPolicy::Monthly {
            day: value.unwrap_or(1).clamp(1, 28) as u32,
        },
        Some("date") => match date {
            Some(on) => RefreshPolicy::Date { on },
            None => RefreshPolicy::None,
        },
        Some("activity") => RefreshPolicy::Activity,
        _ => RefreshPolicy::None,
    }
}

fn rule_from_row(row: &Row) -> Result<RewardRule> {
    let scheme_id: Option<i64> = row.get(1)?;
    let payment_method_id: Option<i64> = row.get(2)?;
    let owner = match (scheme_id, payment_method_id) {
        (Some(id), _) => RuleOwner::Scheme(id),
        (None, Some(id)) => RuleOwner::PaymentMethod(id),
        (None, None) => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Null,
                "reward rule has no owner".into(),
            ))
        }
    };
    let method: String = row.get(4)?;
    let basis: String = row.get(6)?;
    Ok(RewardRule {
        id: row.get(0)?,
        owner,
        percentage: row.get(3)?,
        method: CalculationMethod::parse(&method).unwrap_or(CalculationMethod::Round),
        quota_limit: row.get(5)?,
        basis: QuotaBasis::parse(&basis).unwrap_or(QuotaBasis::Transaction),
        refresh: refresh_from_columns(row.get(7)?, row.get(8)?, row.get(9)?),
        display_order: row.get(10)?,
    })
}

const RULE_COLUMNS: &str = "id, scheme_id, payment_method_id, percentage, calculation_method,
    quota_limit, quota_calculation_basis, quota_refresh_type, quota_refresh_value,
    quota_refresh_date, display_order";

#[allow(clippy::too_many_arguments)]
pub fn add_rule(
    conn: &Connection,
    owner: RuleOwner,
    percentage: f64,
    method: CalculationMethod,
    quota_limit: Option<f64>,
    basis: QuotaBasis,
    refresh: RefreshPolicy,
    display_order: i64,
) -> Result<i64> {
    let (scheme_id, payment_method_id) = match owner {
        RuleOwner::Scheme(id) => (Some(id), None),
        RuleOwner::PaymentMethod(id) => (None, Some(id)),
    };
    let (kind, value, date) = refresh_to_columns(refresh);
    conn.execute(
        "INSERT INTO reward_rules
            (scheme_id, payment_method_id, percentage, calculation_method, quota_limit,
             quota_calculation_basis, quota_refresh_type, quota_refresh_value,
             quota_refresh_date, display_order)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            scheme_id,
            payment_method_id,
            percentage,
            method.as_str(),
            quota_limit,
            basis.as_str(),
            kind,
            value,
            date,
            display_order
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Updates the calculation parameters of an existing rule. Refresh policy
/// and ownership are fixed at creation.
pub fn update_rule_calculation(
    conn: &Connection,
    id: i64,
    percentage: f64,
    method: CalculationMethod,
    quota_limit: Option<f64>,
    basis: QuotaBasis,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE reward_rules
         SET percentage = ?1, calculation_method = ?2, quota_limit = ?3,
             quota_calculation_basis = ?4
         WHERE id = ?5",
        params![percentage, method.as_str(), quota_limit, basis.as_str(), id],
    )?;
    Ok(changed > 0)
}

pub fn get_rule(conn: &Connection, id: i64) -> Result<Option<RewardRule>> {
    conn.query_row(
        &format!("SELECT {RULE_COLUMNS} FROM reward_rules WHERE id = ?1"),
        params![id],
        rule_from_row,
    )
    .optional()
}

pub fn rules_for_scheme(conn: &Connection, scheme_id: i64) -> Result<Vec<RewardRule>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RULE_COLUMNS} FROM reward_rules WHERE scheme_id = ?1 ORDER BY display_order"
    ))?;
    let rows = stmt.query_map(params![scheme_id], rule_from_row)?;
    rows.collect()
}

pub fn rules_for_payment_method(
    conn: &Connection,
    payment_method_id: i64,
) -> Result<Vec<RewardRule>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RULE_COLUMNS} FROM reward_rules WHERE payment_method_id = ?1 ORDER BY display_order"
    ))?;
    let rows = stmt.query_map(params![payment_method_id], rule_from_row)?;
    rows.collect()
}

pub fn list_rules(conn: &Connection) -> Result<Vec<RewardRule>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RULE_COLUMNS} FROM reward_rules ORDER BY scheme_id, payment_method_id, display_order"
    ))?;
    let rows = stmt.query_map([], rule_from_row)?;
    rows.collect()
}

// --- quota trackings ---

fn tracking_from_row(row: &Row) -> Result<QuotaTracking> {
    let scheme_id: Option<i64> = row.get(1)?;
    let payment_method_id: Option<i64> = row.get(2)?;
    let scope = match (scheme_id, payment_method_id) {
        (Some(scheme_id), payment_method_id) => TrackingScope::Scheme {
            scheme_id,
            payment_method_id,
        },
        (None, Some(payment_method_id)) => TrackingScope::PaymentMethod { payment_method_id },
        (None, None) => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Null,
                "tracking row has no scope".into(),
            ))
        }
    };
    Ok(QuotaTracking {
        id: row.get(0)?,
        scope,
        rule_id: row.get(3)?,
        used_quota: row.get(4)?,
        current_amount: row.get(5)?,
        manual_adjustment: row.get(6)?,
        remaining_quota: row.get(7)?,
        last_refresh_at: row.get(8)?,
        next_refresh_at: row.get(9)?,
    })
}

const TRACKING_COLUMNS: &str = "id, scheme_id, payment_method_id, rule_id, used_quota,
    current_amount, manual_adjustment, remaining_quota, last_refresh_at, next_refresh_at";

/// Looks up the tracking row for a (scope, rule) pair. The scheme variant
/// matches payment_method_id null-vs-value so a scheme transaction that also
/// used a payment method never collides with the method's own tracking.
pub fn find_tracking(
    conn: &Connection,
    scope: TrackingScope,
    rule_id: i64,
) -> Result<Option<QuotaTracking>> {
    match scope {
        TrackingScope::Scheme {
            scheme_id,
            payment_method_id,
        } => conn
            .query_row(
                &format!(
                    "SELECT {TRACKING_COLUMNS} FROM quota_trackings
                     WHERE scheme_id = ?1 AND rule_id = ?2
                       AND (payment_method_id = ?3 OR (payment_method_id IS NULL AND ?3 IS NULL))"
                ),
                params![scheme_id, rule_id, payment_method_id],
                tracking_from_row,
            )
            .optional(),
        TrackingScope::PaymentMethod { payment_method_id } => conn
            .query_row(
                &format!(
                    "SELECT {TRACKING_COLUMNS} FROM quota_trackings
                     WHERE payment_method_id = ?1 AND rule_id = ?2 AND scheme_id IS NULL"
                ),
                params![payment_method_id, rule_id],
                tracking_from_row,
            )
            .optional(),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn insert_tracking(
    conn: &Connection,
    scope: TrackingScope,
    rule_id: i64,
    used_quota: f64,
    current_amount: f64,
    manual_adjustment: f64,
    remaining_quota: Option<f64>,
    next_refresh_at: Option<DateTime<Utc>>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO quota_trackings
            (scheme_id, payment_method_id, rule_id, used_quota, current_amount,
             manual_adjustment, remaining_quota, next_refresh_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            scope.scheme_id(),
            scope.payment_method_id(),
            rule_id,
            used_quota,
            current_amount,
            manual_adjustment,
            remaining_quota,
            next_refresh_at
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_tracking_amounts(
    conn: &Connection,
    tracking_id: i64,
    used_quota: f64,
    current_amount: f64,
    remaining_quota: Option<f64>,
) -> Result<()> {
    conn.execute(
        "UPDATE quota_trackings
         SET used_quota = ?1, current_amount = ?2, remaining_quota = ?3
         WHERE id = ?4",
        params![used_quota, current_amount, remaining_quota, tracking_id],
    )?;
    Ok(())
}

pub fn update_tracking_adjustment(
    conn: &Connection,
    tracking_id: i64,
    manual_adjustment: f64,
    remaining_quota: Option<f64>,
) -> Result<()> {
    conn.execute(
        "UPDATE quota_trackings
         SET manual_adjustment = ?1, remaining_quota = ?2
         WHERE id = ?3",
        params![manual_adjustment, remaining_quota, tracking_id],
    )?;
    Ok(())
}

/// Resets a tracking for a new period: zeroes the accumulators and the
/// manual adjustment, which corrected the now-expired period.
pub fn rollover_tracking(
    conn: &Connection,
    tracking_id: i64,
    remaining_quota: Option<f64>,
    next_refresh_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE quota_trackings
         SET used_quota = 0, current_amount = 0, manual_adjustment = 0,
             remaining_quota = ?1, last_refresh_at = ?2, next_refresh_at = ?3
         WHERE id = ?4",
        params![remaining_quota, now, next_refresh_at, tracking_id],
    )?;
    Ok(())
}

/// All trackings with a scheduled refresh, for the read-time sweep.
pub fn trackings_with_refresh(conn: &Connection) -> Result<Vec<QuotaTracking>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TRACKING_COLUMNS} FROM quota_trackings WHERE next_refresh_at IS NOT NULL"
    ))?;
    let rows = stmt.query_map([], tracking_from_row)?;
    rows.collect()
}

pub fn all_trackings(conn: &Connection) -> Result<Vec<QuotaTracking>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {TRACKING_COLUMNS} FROM quota_trackings ORDER BY id"))?;
    let rows = stmt.query_map([], tracking_from_row)?;
    rows.collect()
}

// --- transactions ---

fn transaction_from_row(row: &Row) -> Result<TransactionRecord> {
    Ok(TransactionRecord {
        id: row.get(0)?,
        transaction_date: row.get(1)?,
        amount: row.get(2)?,
        scheme_id: row.get(3)?,
        payment_method_id: row.get(4)?,
        note: row.get(5)?,
        created_at: row.get(6)?,
    })
}

const TX_COLUMNS: &str =
    "id, transaction_date, amount, scheme_id, payment_method_id, note, created_at";

pub fn insert_transaction(
    conn: &Connection,
    transaction_date: NaiveDate,
    amount: Option<i64>,
    scheme_id: Option<i64>,
    payment_method_id: Option<i64>,
    note: Option<&str>,
    created_at: DateTime<Utc>,
) -> Result<TransactionRecord> {
    conn.execute(
        "INSERT INTO transactions
            (transaction_date, amount, scheme_id, payment_method_id, note, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            transaction_date,
            amount,
            scheme_id,
            payment_method_id,
            note,
            created_at
        ],
    )?;
    let id = conn.last_insert_rowid();
    conn.query_row(
        &format!("SELECT {TX_COLUMNS} FROM transactions WHERE id = ?1"),
        params![id],
        transaction_from_row,
    )
}

pub fn get_transaction(conn: &Connection, id: i64) -> Result<Option<TransactionRecord>> {
    conn.query_row(
        &format!("SELECT {TX_COLUMNS} FROM transactions WHERE id = ?1"),
        params![id],
        transaction_from_row,
    )
    .optional()
}

pub fn delete_transaction(conn: &Connection, id: i64) -> Result<bool> {
    let changed = conn.execute("DELETE FROM transactions WHERE id = ?1", params![id])?;
    Ok(changed > 0)
}

pub fn list_transactions(conn: &Connection) -> Result<Vec<TransactionListRow>> {
    let mut stmt = conn.prepare(
        "SELECT t.id, t.transaction_date, t.amount,
                CASE
                  WHEN t.scheme_id IS NOT NULL AND t.payment_method_id IS NOT NULL THEN
                    s.name || '-' || pm.name
                  WHEN t.scheme_id IS NOT NULL THEN s.name
                  WHEN t.payment_method_id IS NOT NULL THEN pm.name
                  ELSE '-'
                END as scope_name,
                t.note
         FROM transactions t
         LEFT JOIN schemes s ON t.scheme_id = s.id
         LEFT JOIN payment_methods pm ON t.payment_method_id = pm.id
         ORDER BY t.created_at DESC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(TransactionListRow {
            id: row.get(0)?,
            transaction_date: row.get(1)?,
            amount: row.get(2)?,
            scope_name: row.get(3)?,
            note: row.get(4)?,
        })
    })?;
    rows.collect()
}

/// Amounts of the transactions that fed a rule's current tracking window,
/// for best-effort recompute after a rule edit.
pub fn transaction_amounts_in_window(
    conn: &Connection,
    owner: RuleOwner,
    window_start: Option<DateTime<Utc>>,
    window_end: DateTime<Utc>,
) -> Result<Vec<i64>> {
    let (column, owner_id) = match owner {
        RuleOwner::Scheme(id) => ("scheme_id", id),
        RuleOwner::PaymentMethod(id) => ("payment_method_id", id),
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT amount FROM transactions
         WHERE {column} = ?1 AND amount IS NOT NULL
           AND (?2 IS NULL OR created_at >= ?2)
           AND created_at <= ?3"
    ))?;
    let rows = stmt.query_map(params![owner_id, window_start, window_end], |row| row.get(0))?;
    rows.collect()
}
