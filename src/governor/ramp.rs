//! Warmup ramp curves — per-day send caps, looked up by schedule key.
//!
//! Days past a table's end fall back to the sender's steady-state daily cap.

use chrono::NaiveDate;

use crate::model::WarmupState;

/// 5 → 50 over 28 days. Safest, recommended for new domains.
static CONSERVATIVE: &[u32] = &[
    5, 5, 5, // days 1-3
    10, 10, 10, 10, // days 4-7
    15, 15, 15, // days 8-10
    20, 20, 20, 20, // days 11-14
    25, 25, // days 15-16
    30, 30, // days 17-18
    35, 35, // days 19-20
    40, 40, // days 21-22
    45, 45, // days 23-24
    50, 50, 50, 50, // days 25-28
];

/// 10 → 50 over 18 days.
static MODERATE: &[u32] = &[
    10, 10, 15, 15, 20, 20, 25, 25, 30, 30, 35, 35, 40, 40, 45, 45, 50, 50,
];

/// 20 → 50 over 10 days. Faster, higher risk.
static AGGRESSIVE: &[u32] = &[20, 25, 30, 35, 40, 45, 50, 50, 50, 50];

/// Look up a ramp table by key. Unknown keys resolve to `conservative`.
pub fn ramp_table(key: &str) -> &'static [u32] {
    match key {
        "moderate" => MODERATE,
        "aggressive" => AGGRESSIVE,
        _ => CONSERVATIVE,
    }
}

/// The sender's cap on a given calendar date.
///
/// Warmup disabled (or not yet started) yields the steady-state daily cap;
/// otherwise the ramp entry for `days_since(start)`, with days past the
/// table's end using the daily cap.
pub fn effective_cap(warmup: &WarmupState, daily_cap: u32, on_date: NaiveDate) -> u32 {
    if !warmup.enabled {
        return daily_cap;
    }
    let Some(start) = warmup.start_date else {
        return daily_cap;
    };
    let day = (on_date - start).num_days();
    if day < 0 {
        return daily_cap;
    }
    ramp_table(&warmup.ramp_key)
        .get(day as usize)
        .copied()
        .unwrap_or(daily_cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warmup(key: &str, start: NaiveDate) -> WarmupState {
        WarmupState {
            enabled: true,
            start_date: Some(start),
            ramp_key: key.into(),
        }
    }

    #[test]
    fn disabled_warmup_uses_daily_cap() {
        let state = WarmupState::default();
        let date = NaiveDate::from_ymd_opt(2026, 7, 6).unwrap();
        assert_eq!(effective_cap(&state, 40, date), 40);
    }

    #[test]
    fn conservative_day_zero_is_five() {
        let start = NaiveDate::from_ymd_opt(2026, 7, 6).unwrap();
        assert_eq!(effective_cap(&warmup("conservative", start), 50, start), 5);
    }

    #[test]
    fn ramp_advances_with_days() {
        let start = NaiveDate::from_ymd_opt(2026, 7, 6).unwrap();
        let state = warmup("moderate", start);
        assert_eq!(effective_cap(&state, 50, start), 10);
        let day4 = start + chrono::Duration::days(4);
        assert_eq!(effective_cap(&state, 50, day4), 20);
    }

    #[test]
    fn past_table_end_uses_daily_cap() {
        let start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let state = warmup("aggressive", start);
        let far = start + chrono::Duration::days(365);
        assert_eq!(effective_cap(&state, 80, far), 80);
    }

    #[test]
    fn unknown_key_falls_back_to_conservative() {
        assert_eq!(ramp_table("whatever")[0], 5);
    }

    #[test]
    fn tables_are_monotone() {
        for table in [ramp_table("conservative"), ramp_table("moderate"), ramp_table("aggressive")] {
            for pair in table.windows(2) {
                assert!(pair[1] >= pair[0]);
            }
        }
    }
}
