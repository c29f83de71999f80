//! Weekly trading session calendar.
//!
//! Futures-style week: closed all day Saturday, open continuously from a
//! Sunday-evening edge through a Friday-evening edge (exchange-local time),
//! open at all other times. Edge times are configurable; DST is handled by
//! evaluating edges in the exchange timezone.

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Weekly open/close schedule governing when the live connection should be
/// active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeeklyCalendar {
    /// Exchange timezone
    #[serde(with = "tz_serde")]
    pub timezone: Tz,
    /// Weekday of the weekly open edge
    pub open_day: Weekday,
    /// Local time of the weekly open edge
    pub open_time: NaiveTime,
    /// Weekday of the weekly close edge
    pub close_day: Weekday,
    /// Local time of the weekly close edge
    pub close_time: NaiveTime,
}

mod tz_serde {
    use chrono_tz::Tz;
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(tz.name())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Tz, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Tz::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl WeeklyCalendar {
    pub fn new(
        timezone: Tz,
        open_day: Weekday,
        open_time: NaiveTime,
        close_day: Weekday,
        close_time: NaiveTime,
    ) -> Self {
        Self {
            timezone,
            open_day,
            open_time,
            close_day,
            close_time,
        }
    }

    /// CME Globex week: Sunday 17:00 through Friday 16:00, Chicago time.
    pub fn cme_globex() -> Self {
        Self::new(
            chrono_tz::America::Chicago,
            Weekday::Sun,
            NaiveTime::from_hms_opt(17, 0, 0).expect("valid time"),
            Weekday::Fri,
            NaiveTime::from_hms_opt(16, 0, 0).expect("valid time"),
        )
    }

    /// Second-of-week with the week anchored at Sunday 00:00 local.
    fn second_of_week(day: Weekday, time: NaiveTime) -> u32 {
        day.num_days_from_sunday() * 86_400 + time.num_seconds_from_midnight()
    }

    /// Is the market open at `now`?
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.timezone);
        let s = Self::second_of_week(local.weekday(), local.time());
        let open_s = Self::second_of_week(self.open_day, self.open_time);
        let close_s = Self::second_of_week(self.close_day, self.close_time);

        if open_s <= close_s {
            s >= open_s && s < close_s
        } else {
            s >= open_s || s < close_s
        }
    }

    /// Next open edge strictly after `now`.
    pub fn next_open(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.next_edge(now, self.open_day, self.open_time)
    }

    /// Next close edge strictly after `now`.
    pub fn next_close(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.next_edge(now, self.close_day, self.close_time)
    }

    fn next_edge(&self, now: DateTime<Utc>, day: Weekday, time: NaiveTime) -> DateTime<Utc> {
        let local = now.with_timezone(&self.timezone);

        for offset in 0..=7 {
            let date = local.date_naive() + Duration::days(offset);
            if date.weekday() != day {
                continue;
            }
            // `earliest` resolves DST fold/skip deterministically
            if let Some(candidate) = self.timezone.from_local_datetime(&date.and_time(time)).earliest()
            {
                if candidate > local {
                    return candidate.with_timezone(&Utc);
                }
            }
        }

        // Only reachable if the edge falls inside a DST skip; try a week out
        now + Duration::weeks(1)
    }
}

impl Default for WeeklyCalendar {
    fn default() -> Self {
        Self::cme_globex()
    }
}
