use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};

use crate::models::RefreshPolicy;

fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

/// Next point at which a rule's tracking rolls over, or None when the quota
/// never refreshes again.
///
/// - `Monthly`: this month's occurrence of `day` if `now` is still before
///   it, otherwise next month's. `day` is clamped to 1-28 so every month
///   has the date.
/// - `Date`: the literal date while it is still in the future; terminal
///   (None) once passed.
/// - `Activity`: the owning scheme's activity end date, a single terminal
///   refresh point.
pub fn next_refresh_time(
    policy: RefreshPolicy,
    activity_end: Option<NaiveDate>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match policy {
        RefreshPolicy::None => None,
        RefreshPolicy::Monthly { day } => {
            let day = day.clamp(1, 28);
            let this_month = midnight_utc(NaiveDate::from_ymd_opt(now.year(), now.month(), day)?);
            if now < this_month {
                Some(this_month)
            } else {
                let (year, month) = if now.month() == 12 {
                    (now.year() + 1, 1)
                } else {
                    (now.year(), now.month() + 1)
                };
                Some(midnight_utc(NaiveDate::from_ymd_opt(year, month, day)?))
            }
        }
        RefreshPolicy::Date { on } => {
            let at = midnight_utc(on);
            if at > now {
                Some(at)
            } else {
                None
            }
        }
        RefreshPolicy::Activity => activity_end.map(midnight_utc),
    }
}

/// A tracking is stale when its scheduled refresh point has passed.
pub fn is_stale(next_refresh_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match next_refresh_at {
        Some(at) => now >= at,
        None => false,
    }
}
