use chrono::{DateTime, Datelike, Days, LocalResult, NaiveDateTime, TimeZone, Utc};

use crate::alarm::model::{DaySet, TimeOfDay};

const SCAN_DAYS: u64 = 14;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct NextTrigger {
    pub at: DateTime<Utc>,
    pub skipped: Option<DateTime<Utc>>,
}

/// Next trigger instant strictly after `now`, or `None` when `days` is empty.
///
/// With `skip_next` the first candidate is consumed and the one after it is
/// returned. Comparisons happen on absolute instants; calendar and wall-clock
/// arithmetic happen in `timezone`.
pub fn compute_next<Tz>(
    now: &DateTime<Utc>,
    time: TimeOfDay,
    days: DaySet,
    skip_next: bool,
    timezone: &Tz,
) -> Option<NextTrigger>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    let first = next_occurrence(now, time, days, timezone)?;
    if !skip_next {
        return Some(NextTrigger {
            at: first,
            skipped: None,
        });
    }
    let second = next_occurrence(&first, time, days, timezone)?;
    Some(NextTrigger {
        at: second,
        skipped: Some(first),
    })
}

fn next_occurrence<Tz>(
    after: &DateTime<Utc>,
    time: TimeOfDay,
    days: DaySet,
    timezone: &Tz,
) -> Option<DateTime<Utc>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    if days.is_empty() {
        return None;
    }
    let local_after = after.with_timezone(timezone);
    for day_offset in 0_u64..SCAN_DAYS {
        let date = local_after
            .date_naive()
            .checked_add_days(Days::new(day_offset))?;
        if !days.contains(date.weekday()) {
            continue;
        }
        let naive = date.and_time(time.to_naive());
        let candidate = match resolve_local_datetime(timezone, naive) {
            Some(value) => value.with_timezone(&Utc),
            None => continue,
        };

        if candidate > *after {
            return Some(candidate);
        }
    }

    None
}

fn resolve_local_datetime<Tz>(timezone: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    match timezone.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(first, _second) => Some(first),
        LocalResult::None => None,
    }
}

pub fn format_instant<Tz>(instant: Option<DateTime<Utc>>, timezone: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    match instant {
        Some(dt) => dt
            .with_timezone(timezone)
            .format("%a %Y-%m-%d %H:%M %Z")
            .to_string(),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, Weekday};
    use chrono_tz::America::New_York;
    use chrono_tz::UTC;

    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .expect("valid instant")
    }

    fn seven() -> TimeOfDay {
        TimeOfDay::new(7, 0).expect("valid time")
    }

    // 2026-03-02 is a Monday.
    #[test]
    fn recurring_alarm_uses_today_when_time_is_still_ahead() {
        let now = utc(2026, 3, 2, 6, 0);
        let next = compute_next(&now, seven(), DaySet::WEEKDAYS, false, &UTC).expect("next");
        assert_eq!(next.at, utc(2026, 3, 2, 7, 0));
        assert_eq!(next.skipped, None);
    }

    #[test]
    fn recurring_alarm_skips_today_once_time_has_passed() {
        let friday_evening = utc(2026, 3, 6, 20, 0);
        let next =
            compute_next(&friday_evening, seven(), DaySet::WEEKDAYS, false, &UTC).expect("next");
        assert_eq!(next.at, utc(2026, 3, 9, 7, 0));
    }

    #[test]
    fn occurrence_exactly_at_now_is_not_returned() {
        let now = utc(2026, 3, 2, 7, 0);
        let next = compute_next(&now, seven(), DaySet::WEEKDAYS, false, &UTC).expect("next");
        assert_eq!(next.at, utc(2026, 3, 3, 7, 0));
    }

    #[test]
    fn one_time_alarm_rolls_to_next_week_when_passed() {
        let monday = DaySet::from_days([Weekday::Mon]);
        let now = utc(2026, 3, 2, 8, 0);
        let next = compute_next(&now, seven(), monday, false, &UTC).expect("next");
        assert_eq!(next.at, utc(2026, 3, 9, 7, 0));

        let wednesday = DaySet::from_days([Weekday::Wed]);
        let next = compute_next(&now, seven(), wednesday, false, &UTC).expect("next");
        assert_eq!(next.at, utc(2026, 3, 4, 7, 0));
    }

    #[test]
    fn skip_consumes_exactly_one_candidate() {
        let now = utc(2026, 3, 2, 6, 0);
        let next = compute_next(&now, seven(), DaySet::WEEKDAYS, true, &UTC).expect("next");
        assert_eq!(next.skipped, Some(utc(2026, 3, 2, 7, 0)));
        assert_eq!(next.at, utc(2026, 3, 3, 7, 0));

        let once = DaySet::from_days([Weekday::Mon]);
        let next = compute_next(&now, seven(), once, true, &UTC).expect("next");
        assert_eq!(next.at, utc(2026, 3, 9, 7, 0));
    }

    #[test]
    fn empty_day_set_has_no_next_trigger() {
        let now = utc(2026, 3, 2, 6, 0);
        assert_eq!(
            compute_next(&now, seven(), DaySet::default(), false, &UTC),
            None
        );
    }

    #[test]
    fn wall_clock_time_is_kept_in_the_configured_zone() {
        // 06:00 UTC is 01:00 in New York on this date.
        let now = utc(2026, 3, 2, 6, 0);
        let next = compute_next(&now, seven(), DaySet::WEEKDAYS, false, &New_York).expect("next");
        assert_eq!(next.at, utc(2026, 3, 2, 12, 0));
    }

    #[test]
    fn dst_spring_forward_nonexistent_time_is_skipped() {
        let sunday = DaySet::from_days([Weekday::Sun]);
        let now = New_York
            .with_ymd_and_hms(2026, 3, 8, 0, 30, 0)
            .single()
            .expect("valid")
            .with_timezone(&Utc);
        let time = TimeOfDay::new(2, 30).expect("valid");
        let next = compute_next(&now, time, sunday, false, &New_York).expect("next occurrence");
        assert_eq!(
            next.at.with_timezone(&New_York).date_naive(),
            NaiveDate::from_ymd_opt(2026, 3, 15).expect("valid date")
        );
    }

    #[test]
    fn dst_fall_back_chooses_first_ambiguous_instance() {
        let sunday = DaySet::from_days([Weekday::Sun]);
        let now = New_York
            .with_ymd_and_hms(2026, 11, 1, 0, 0, 0)
            .single()
            .expect("valid")
            .with_timezone(&Utc);
        let naive = NaiveDate::from_ymd_opt(2026, 11, 1)
            .expect("date")
            .and_hms_opt(1, 30, 0)
            .expect("time");
        let expected = match New_York.from_local_datetime(&naive) {
            LocalResult::Ambiguous(first, _second) => first.with_timezone(&Utc),
            _ => panic!("expected ambiguous local time"),
        };

        let time = TimeOfDay::new(1, 30).expect("valid");
        let actual = compute_next(&now, time, sunday, false, &New_York).expect("next");
        assert_eq!(actual.at, expected);
    }

    #[test]
    fn format_instant_renders_local_wall_clock() {
        let at = utc(2026, 3, 2, 12, 0);
        assert_eq!(
            format_instant(Some(at), &New_York),
            "Mon 2026-03-02 07:00 EST"
        );
        assert_eq!(format_instant(None, &UTC), "-");
    }
}
