mod db;
mod engine;
mod error;
mod models;
mod refresh;
mod reward;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use models::{CalculationMethod, QuotaBasis, RefreshPolicy, RuleListRow, RuleOwner, TrackingScope};
use tabled::Table;
use tracing_subscriber::EnvFilter;

use crate::error::{AppError, AppResult};

/// Reward quota tracker — record spending, track reward quotas per scheme
#[derive(Parser)]
#[command(name = "quota-tracker", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a reward scheme (a card's promotional program)
    AddScheme {
        /// Scheme name (e.g. "Everyday Cashback")
        #[arg(long)]
        name: String,
        /// Promotional end date (YYYY-MM-DD), used by activity-type refresh
        #[arg(long)]
        activity_end: Option<NaiveDate>,
    },

    /// Add a payment method with its own reward rules
    AddPaymentMethod {
        #[arg(long)]
        name: String,
    },

    /// Attach a reward rule to a scheme or payment method
    AddRule {
        /// Owning scheme ID (exactly one of --scheme / --payment-method)
        #[arg(long)]
        scheme: Option<i64>,
        /// Owning payment method ID
        #[arg(long)]
        payment_method: Option<i64>,
        /// Reward percentage (e.g. 2.7)
        #[arg(long)]
        percentage: f64,
        /// Rounding method: round, floor, ceil
        #[arg(long, default_value = "round")]
        method: String,
        /// Quota cap per period (omit for unlimited)
        #[arg(long)]
        quota_limit: Option<f64>,
        /// Calculation basis: transaction or statement
        #[arg(long, default_value = "transaction")]
        basis: String,
        /// Refresh policy: monthly, date, activity (omit for none)
        #[arg(long)]
        refresh_type: Option<String>,
        /// Day of month for monthly refresh (1-28)
        #[arg(long)]
        refresh_day: Option<u32>,
        /// Calendar date for one-shot refresh (YYYY-MM-DD)
        #[arg(long)]
        refresh_date: Option<NaiveDate>,
        #[arg(long, default_value_t = 0)]
        display_order: i64,
    },

    /// Edit a rule's calculation parameters and resync its tracking
    EditRule {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        percentage: f64,
        #[arg(long, default_value = "round")]
        method: String,
        #[arg(long)]
        quota_limit: Option<f64>,
        #[arg(long, default_value = "transaction")]
        basis: String,
    },

    /// List all reward rules
    ListRules,

    /// Record a transaction and accumulate reward quota
    Record {
        /// Transaction date (YYYY-MM-DD)
        #[arg(long)]
        date: NaiveDate,
        /// Amount in whole currency units
        #[arg(long)]
        amount: Option<i64>,
        #[arg(long)]
        scheme: Option<i64>,
        #[arg(long)]
        payment_method: Option<i64>,
        #[arg(long)]
        note: Option<String>,
    },

    /// Delete a transaction and reverse its quota accumulation
    DeleteTransaction {
        #[arg(long)]
        id: i64,
    },

    /// Set (or clear) the manual adjustment on a rule's tracking
    SetAdjustment {
        #[arg(long)]
        rule: i64,
        #[arg(long)]
        scheme: Option<i64>,
        #[arg(long)]
        payment_method: Option<i64>,
        /// Absolute adjustment value; omit to clear back to 0
        #[arg(long)]
        value: Option<f64>,
    },

    /// List all recorded transactions
    ListTransactions,

    /// Show current quota state (stale trackings refresh first)
    Quota {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn parse_method(s: &str) -> AppResult<CalculationMethod> {
    CalculationMethod::parse(s)
        .ok_or_else(|| AppError::Validation(format!("unknown calculation method '{s}'")))
}

fn parse_basis(s: &str) -> AppResult<QuotaBasis> {
    QuotaBasis::parse(s).ok_or_else(|| AppError::Validation(format!("unknown quota basis '{s}'")))
}

fn parse_refresh(
    refresh_type: Option<&str>,
    refresh_day: Option<u32>,
    refresh_date: Option<NaiveDate>,
) -> AppResult<RefreshPolicy> {
    match refresh_type {
        None => Ok(RefreshPolicy::None),
        Some("monthly") => {
            let day = refresh_day
                .ok_or_else(|| AppError::Validation("monthly refresh needs --refresh-day".into()))?;
            if !(1..=28).contains(&day) {
                return Err(AppError::Validation("--refresh-day must be 1-28".into()));
            }
            Ok(RefreshPolicy::Monthly { day })
        }
        Some("date") => {
            let on = refresh_date
                .ok_or_else(|| AppError::Validation("date refresh needs --refresh-date".into()))?;
            Ok(RefreshPolicy::Date { on })
        }
        Some("activity") => Ok(RefreshPolicy::Activity),
        Some(other) => Err(AppError::Validation(format!(
            "unknown refresh type '{other}'"
        ))),
    }
}

fn rule_owner(scheme: Option<i64>, payment_method: Option<i64>) -> AppResult<RuleOwner> {
    match (scheme, payment_method) {
        (Some(id), None) => Ok(RuleOwner::Scheme(id)),
        (None, Some(id)) => Ok(RuleOwner::PaymentMethod(id)),
        _ => Err(AppError::Validation(
            "exactly one of --scheme / --payment-method is required".into(),
        )),
    }
}

fn adjustment_scope(scheme: Option<i64>, payment_method: Option<i64>) -> AppResult<TrackingScope> {
    match (scheme, payment_method) {
        (Some(scheme_id), payment_method_id) => Ok(TrackingScope::Scheme {
            scheme_id,
            payment_method_id,
        }),
        (None, Some(payment_method_id)) => Ok(TrackingScope::PaymentMethod { payment_method_id }),
        (None, None) => Err(AppError::Validation(
            "--scheme or --payment-method is required".into(),
        )),
    }
}

fn describe_refresh(policy: RefreshPolicy) -> String {
    match policy {
        RefreshPolicy::None => "-".to_string(),
        RefreshPolicy::Monthly { day } => format!("monthly (day {day})"),
        RefreshPolicy::Date { on } => format!("on {on}"),
        RefreshPolicy::Activity => "activity end".to_string(),
    }
}

fn run(cli: Cli) -> AppResult<()> {
    let mut conn = db::init_db()?;
    let now = Utc::now();

    match cli.command {
        Commands::AddScheme { name, activity_end } => {
            let id = db::add_scheme(&conn, &name, activity_end)?;
            println!("Added scheme '{}' with ID {}", name, id);
        }

        Commands::AddPaymentMethod { name } => {
            let id = db::add_payment_method(&conn, &name)?;
            println!("Added payment method '{}' with ID {}", name, id);
        }

        Commands::AddRule {
            scheme,
            payment_method,
            percentage,
            method,
            quota_limit,
            basis,
            refresh_type,
            refresh_day,
            refresh_date,
            display_order,
        } => {
            if percentage <= 0.0 {
                return Err(AppError::Validation("--percentage must be > 0".into()));
            }
            let owner = rule_owner(scheme, payment_method)?;
            let refresh = parse_refresh(refresh_type.as_deref(), refresh_day, refresh_date)?;
            let id = db::add_rule(
                &conn,
                owner,
                percentage,
                parse_method(&method)?,
                quota_limit,
                parse_basis(&basis)?,
                refresh,
                display_order,
            )?;
            println!("Added rule {} at {}%", id, percentage);
        }

        Commands::EditRule {
            id,
            percentage,
            method,
            quota_limit,
            basis,
        } => {
            if percentage <= 0.0 {
                return Err(AppError::Validation("--percentage must be > 0".into()));
            }
            let changed = db::update_rule_calculation(
                &conn,
                id,
                percentage,
                parse_method(&method)?,
                quota_limit,
                parse_basis(&basis)?,
            )?;
            if !changed {
                return Err(AppError::NotFound(format!("reward rule {id}")));
            }
            // Resync is best-effort; the edit itself has already landed.
            if let Err(err) = engine::recompute_rule_tracking(&mut conn, id, now) {
                tracing::warn!(rule = id, error = %err, "tracking recompute failed after rule edit");
            }
            println!("Updated rule {}", id);
        }

        Commands::ListRules => {
            let rules = db::list_rules(&conn)?;
            if rules.is_empty() {
                println!(
                    "No rules found. Add one with: quota-tracker add-rule --scheme 1 --percentage 2.7"
                );
            } else {
                let rows: Vec<RuleListRow> = rules
                    .into_iter()
                    .map(|r| RuleListRow {
                        id: r.id,
                        owner: match r.owner {
                            RuleOwner::Scheme(id) => format!("scheme {id}"),
                            RuleOwner::PaymentMethod(id) => format!("payment method {id}"),
                        },
                        percentage: r.percentage,
                        method: r.method.as_str().to_string(),
                        quota_limit: r.quota_limit,
                        basis: r.basis.as_str().to_string(),
                        refresh: describe_refresh(r.refresh),
                    })
                    .collect();
                println!("{}", Table::new(&rows));
            }
        }

        Commands::Record {
            date,
            amount,
            scheme,
            payment_method,
            note,
        } => {
            let input = engine::NewTransaction {
                transaction_date: date,
                amount,
                scheme_id: scheme,
                payment_method_id: payment_method,
                note,
            };
            let record = engine::apply_transaction(&mut conn, &input, now)?;
            println!("Recorded transaction {}", record.id);
        }

        Commands::DeleteTransaction { id } => {
            engine::rollback_transaction(&mut conn, id, now)?;
            println!("Deleted transaction {} and reversed its quota usage", id);
        }

        Commands::SetAdjustment {
            rule,
            scheme,
            payment_method,
            value,
        } => {
            let scope = adjustment_scope(scheme, payment_method)?;
            engine::set_manual_adjustment(&mut conn, scope, rule, value, now)?;
            match value {
                Some(v) => println!("Set manual adjustment {} on rule {}", v, rule),
                None => println!("Cleared manual adjustment on rule {}", rule),
            }
        }

        Commands::ListTransactions => {
            let rows = db::list_transactions(&conn)?;
            if rows.is_empty() {
                println!("No transactions recorded.");
            } else {
                println!("{}", Table::new(&rows));
            }
        }

        Commands::Quota { json } => {
            let rows = engine::quota_snapshot(&mut conn, now)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&rows)
                        .map_err(|e| AppError::Validation(e.to_string()))?
                );
            } else if rows.is_empty() {
                println!("No quota trackings yet. Record a transaction first.");
            } else {
                println!("{}", Table::new(&rows));
            }
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
