//! Send-window math — membership and next-opening lookups in the
//! window's declared timezone.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};

use crate::model::SendWindow;

impl SendWindow {
    /// The calendar date `now` falls on in the window's timezone. Warmup
    /// counters and cap evaluation are keyed on this date.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.timezone).date_naive()
    }

    /// Whether `now` falls inside the window.
    ///
    /// The closing instant is exclusive: a send landing exactly on the
    /// closing minute waits for the next opening. The current local day
    /// must itself be listed — an overnight interval never spills onto
    /// an unlisted day, so Fri–Sat 22:00–02:00 is closed Sun 01:30.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.timezone);
        let t = local.time();
        let day = local.weekday();

        if !self.days.contains(&day) {
            return false;
        }
        if self.start < self.end {
            t >= self.start && t < self.end
        } else {
            // Overnight interval: the listed day's pre-midnight tail or
            // post-midnight head.
            t >= self.start || t < self.end
        }
    }

    /// Earliest opening instant at or after `after`.
    pub fn next_opening(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let local = after.with_timezone(&self.timezone);
        for offset in 0..=7 {
            let date = local.date_naive() + Duration::days(offset);
            if !self.days.contains(&date.weekday()) {
                continue;
            }
            let naive = date.and_time(self.start);
            // DST gaps shift the opening forward an hour.
            let candidate = self
                .timezone
                .from_local_datetime(&naive)
                .earliest()
                .or_else(|| {
                    self.timezone
                        .from_local_datetime(&(naive + Duration::hours(1)))
                        .earliest()
                });
            if let Some(candidate) = candidate {
                let candidate = candidate.with_timezone(&Utc);
                if candidate >= after {
                    return candidate;
                }
            }
        }
        // Empty day set; nothing better to report.
        after + Duration::days(7)
    }

    /// Earliest opening on the next local calendar day or later. Used for
    /// quota denials, which can never clear before midnight.
    pub fn next_opening_after_today(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let tomorrow = self.local_date(now) + Duration::days(1);
        let midnight = self
            .timezone
            .from_local_datetime(&tomorrow.and_time(NaiveTime::MIN))
            .earliest()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(now + Duration::days(1));
        self.next_opening(midnight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;
    use chrono_tz::Tz;

    fn window(days: &[Weekday], start: (u32, u32), end: (u32, u32), tz: Tz) -> SendWindow {
        SendWindow {
            days: days.to_vec(),
            start: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            end: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
            timezone: tz,
        }
    }

    fn denver_local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        chrono_tz::America::Denver
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn business_hours_membership() {
        let w = window(
            &[Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
            (9, 0),
            (17, 0),
            chrono_tz::UTC,
        );
        // Monday 2026-07-06.
        let monday_10 = Utc.with_ymd_and_hms(2026, 7, 6, 10, 0, 0).unwrap();
        let monday_8 = Utc.with_ymd_and_hms(2026, 7, 6, 8, 0, 0).unwrap();
        let saturday = Utc.with_ymd_and_hms(2026, 7, 11, 10, 0, 0).unwrap();
        assert!(w.contains(monday_10));
        assert!(!w.contains(monday_8));
        assert!(!w.contains(saturday));
    }

    #[test]
    fn closing_minute_is_outside() {
        let w = window(&[Weekday::Mon], (9, 0), (17, 0), chrono_tz::UTC);
        let closing = Utc.with_ymd_and_hms(2026, 7, 6, 17, 0, 0).unwrap();
        assert!(!w.contains(closing));
        // Next opening is the following Monday 09:00.
        let next = w.next_opening(closing);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 7, 13, 9, 0, 0).unwrap());
    }

    #[test]
    fn opening_instant_is_inside() {
        let w = window(&[Weekday::Mon], (9, 0), (17, 0), chrono_tz::UTC);
        let opening = Utc.with_ymd_and_hms(2026, 7, 6, 9, 0, 0).unwrap();
        assert!(w.contains(opening));
        assert_eq!(w.next_opening(opening), opening);
    }

    #[test]
    fn overnight_window_spans_midnight() {
        // 22:00–02:00 Fri–Sat in America/Denver.
        let w = window(
            &[Weekday::Fri, Weekday::Sat],
            (22, 0),
            (2, 0),
            chrono_tz::America::Denver,
        );

        // Sat 2026-07-11 01:30 local — inside (Sat is listed, 01:30 < 02:00).
        assert!(w.contains(denver_local(2026, 7, 11, 1, 30)));
        // Fri 23:00 local — inside.
        assert!(w.contains(denver_local(2026, 7, 10, 23, 0)));
        // Sun 01:30 local — outside: Sun is not listed, the interval
        // does not spill past Saturday.
        assert!(!w.contains(denver_local(2026, 7, 12, 1, 30)));
        // Mon 01:30 local — outside.
        assert!(!w.contains(denver_local(2026, 7, 13, 1, 30)));
        // Fri 21:00 local — before opening.
        assert!(!w.contains(denver_local(2026, 7, 10, 21, 0)));
    }

    #[test]
    fn overnight_next_opening_skips_to_listed_day() {
        let w = window(
            &[Weekday::Fri, Weekday::Sat],
            (22, 0),
            (2, 0),
            chrono_tz::America::Denver,
        );
        // Sunday 2026-07-12 01:30 local is outside; a step landing there
        // reschedules to the next Friday 22:00.
        let next = w.next_opening(denver_local(2026, 7, 12, 1, 30));
        assert_eq!(next, denver_local(2026, 7, 17, 22, 0));

        // Monday 01:30 lands on the same opening.
        let next = w.next_opening(denver_local(2026, 7, 13, 1, 30));
        assert_eq!(next, denver_local(2026, 7, 17, 22, 0));
    }

    #[test]
    fn quota_rollover_lands_on_next_day_opening() {
        let w = window(
            &[Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
            (9, 0),
            (17, 0),
            chrono_tz::UTC,
        );
        // Monday 09:30, quota exhausted — Tuesday 09:00, not Monday again.
        let monday = Utc.with_ymd_and_hms(2026, 7, 6, 9, 30, 0).unwrap();
        assert_eq!(
            w.next_opening_after_today(monday),
            Utc.with_ymd_and_hms(2026, 7, 7, 9, 0, 0).unwrap()
        );
        // Friday rolls over the weekend.
        let friday = Utc.with_ymd_and_hms(2026, 7, 10, 16, 0, 0).unwrap();
        assert_eq!(
            w.next_opening_after_today(friday),
            Utc.with_ymd_and_hms(2026, 7, 13, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn local_date_respects_timezone() {
        let w = window(&[Weekday::Mon], (9, 0), (17, 0), chrono_tz::America::Denver);
        // 03:00 UTC on July 7 is still July 6 in Denver.
        let instant = Utc.with_ymd_and_hms(2026, 7, 7, 3, 0, 0).unwrap();
        assert_eq!(
            w.local_date(instant),
            NaiveDate::from_ymd_opt(2026, 7, 6).unwrap()
        );
    }
}
