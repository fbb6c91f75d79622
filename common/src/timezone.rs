use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};
use chrono_tz::Tz;

use crate::error::DecodeError;

const DEFAULT_TRANSITION_S: i32 = 2 * 3600;

/// A zone as clients name it: either an IANA name (`Europe/Berlin`) or a
/// POSIX TZ rule (`AEST-10AEDT,M10.1.0,M4.1.0/3`).
#[derive(Debug, Clone, PartialEq)]
pub enum Timezone {
    Iana(Tz),
    Posix(PosixTz),
}

impl Default for Timezone {
    fn default() -> Self {
        Self::Iana(Tz::UTC)
    }
}

impl Timezone {
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        let text = text.trim();
        if let Ok(tz) = text.parse::<Tz>() {
            return Ok(Self::Iana(tz));
        }
        PosixTz::parse(text).map(Self::Posix)
    }

    pub fn local(&self, utc: DateTime<Utc>) -> NaiveDateTime {
        match self {
            Self::Iana(tz) => utc.with_timezone(tz).naive_local(),
            Self::Posix(rule) => {
                let naive = utc.naive_utc();
                naive + TimeDelta::seconds(rule.offset_at(naive).into())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transition {
    month: u32,
    week: u32,
    weekday: u32,
    time_s: i32,
}

impl Transition {
    /// Local wall time of this transition in `year` (`Mm.w.d/time` form).
    fn local_in(&self, year: i32) -> Option<NaiveDateTime> {
        let first = NaiveDate::from_ymd_opt(year, self.month, 1)?;
        let next_month = if self.month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)?
        } else {
            NaiveDate::from_ymd_opt(year, self.month + 1, 1)?
        };
        let days_in_month = next_month.signed_duration_since(first).num_days() as u32;

        let first_weekday = first.weekday().num_days_from_sunday();
        let mut day = 1 + (self.weekday + 7 - first_weekday) % 7 + (self.week - 1) * 7;
        while day > days_in_month {
            day -= 7;
        }

        let date = first.with_day(day)?;
        Some(date.and_time(NaiveTime::MIN) + TimeDelta::seconds(self.time_s.into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DaylightRule {
    name: String,
    offset_s: i32,
    start: Transition,
    end: Transition,
}

/// POSIX TZ rule with optional `Mm.w.d` daylight-saving transitions.
/// Offsets are stored east of UTC, the opposite sign of the TZ text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosixTz {
    std_name: String,
    std_offset_s: i32,
    dst: Option<DaylightRule>,
}

impl PosixTz {
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        let invalid = || DecodeError::InvalidTimezone(text.to_string());
        let mut cursor = Cursor { text, pos: 0 };

        let std_name = cursor.name().ok_or_else(invalid)?;
        let std_offset_s = -cursor.offset(24).ok_or_else(invalid)?;
        if cursor.done() {
            return Ok(Self {
                std_name,
                std_offset_s,
                dst: None,
            });
        }

        let dst_name = cursor.name().ok_or_else(invalid)?;
        let offset_s = if cursor.at_offset() {
            -cursor.offset(24).ok_or_else(invalid)?
        } else {
            std_offset_s + 3600
        };
        if !cursor.eat(b',') {
            return Err(invalid());
        }
        let start = cursor.transition().ok_or_else(invalid)?;
        if !cursor.eat(b',') {
            return Err(invalid());
        }
        let end = cursor.transition().ok_or_else(invalid)?;
        if !cursor.done() {
            return Err(invalid());
        }

        Ok(Self {
            std_name,
            std_offset_s,
            dst: Some(DaylightRule {
                name: dst_name,
                offset_s,
                start,
                end,
            }),
        })
    }

    pub fn std_name(&self) -> &str {
        &self.std_name
    }

    pub fn dst_name(&self) -> Option<&str> {
        self.dst.as_ref().map(|dst| dst.name.as_str())
    }

    /// Seconds east of UTC in effect at the UTC instant `utc`.
    pub fn offset_at(&self, utc: NaiveDateTime) -> i32 {
        let Some(dst) = &self.dst else {
            return self.std_offset_s;
        };

        let year = (utc + TimeDelta::seconds(self.std_offset_s.into())).year();
        let (Some(start), Some(end)) = (dst.start.local_in(year), dst.end.local_in(year)) else {
            return self.std_offset_s;
        };
        // start is written in standard time, end in daylight time
        let start_utc = start - TimeDelta::seconds(self.std_offset_s.into());
        let end_utc = end - TimeDelta::seconds(dst.offset_s.into());

        let in_dst = if start_utc < end_utc {
            utc >= start_utc && utc < end_utc
        } else {
            utc >= start_utc || utc < end_utc
        };
        if in_dst {
            dst.offset_s
        } else {
            self.std_offset_s
        }
    }
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn done(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn at_offset(&self) -> bool {
        matches!(self.peek(), Some(b'+' | b'-' | b'0'..=b'9'))
    }

    fn take_while(&mut self, accept: impl Fn(u8) -> bool) -> &str {
        let start = self.pos;
        while self.peek().is_some_and(&accept) {
            self.pos += 1;
        }
        &self.text[start..self.pos]
    }

    fn name(&mut self) -> Option<String> {
        let name = if self.eat(b'<') {
            let quoted = self
                .take_while(|byte| byte.is_ascii_alphanumeric() || byte == b'+' || byte == b'-')
                .to_string();
            if !self.eat(b'>') {
                return None;
            }
            quoted
        } else {
            self.take_while(|byte| byte.is_ascii_alphabetic()).to_string()
        };
        (name.len() >= 3).then_some(name)
    }

    fn number(&mut self, max_digits: usize) -> Option<u32> {
        let digits = self.take_while(|byte| byte.is_ascii_digit());
        if digits.is_empty() || digits.len() > max_digits {
            return None;
        }
        digits.parse().ok()
    }

    /// `[+-]hh[:mm[:ss]]` in seconds, sign as written.
    fn offset(&mut self, max_hours: u32) -> Option<i32> {
        let negative = if self.eat(b'-') {
            true
        } else {
            self.eat(b'+');
            false
        };

        let hours = self.number(3)?;
        if hours > max_hours {
            return None;
        }
        let mut seconds = hours * 3600;
        if self.eat(b':') {
            let minutes = self.number(2).filter(|minutes| *minutes < 60)?;
            seconds += minutes * 60;
            if self.eat(b':') {
                seconds += self.number(2).filter(|secs| *secs < 60)?;
            }
        }

        let seconds = i32::try_from(seconds).ok()?;
        Some(if negative { -seconds } else { seconds })
    }

    fn transition(&mut self) -> Option<Transition> {
        if !self.eat(b'M') {
            return None;
        }
        let month = self.number(2).filter(|month| (1..=12).contains(month))?;
        if !self.eat(b'.') {
            return None;
        }
        let week = self.number(1).filter(|week| (1..=5).contains(week))?;
        if !self.eat(b'.') {
            return None;
        }
        let weekday = self.number(1).filter(|day| *day <= 6)?;
        let time_s = if self.eat(b'/') {
            self.offset(167)?
        } else {
            DEFAULT_TRANSITION_S
        };

        Some(Transition {
            month,
            week,
            weekday,
            time_s,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    const SYDNEY: &str = "AEST-10AEDT,M10.1.0,M4.1.0/3";
    const BERLIN: &str = "CET-1CEST,M3.5.0,M10.5.0/3";

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn offset(rule: &str, at: DateTime<Utc>) -> i32 {
        PosixTz::parse(rule).unwrap().offset_at(at.naive_utc())
    }

    #[test]
    fn parses_companion_zone_list() {
        for text in [
            "UTC0",
            "GMT0BST,M3.5.0/1,M10.5.0",
            BERLIN,
            "EET-2EEST,M3.5.0/3,M10.5.0/4",
            "EST5EDT,M3.2.0,M11.1.0",
            "PST8PDT,M3.2.0,M11.1.0",
            "AKST9AKDT,M3.2.0,M11.1.0",
            "HST10",
            SYDNEY,
            "ACST-9:30ACDT,M10.1.0,M4.1.0/3",
            "AWST-8",
            "NZST-12NZDT,M9.5.0,M4.1.0/3",
            "JST-9",
            "IST-5:30",
        ] {
            assert!(
                matches!(Timezone::parse(text), Ok(Timezone::Posix(_))),
                "{text} did not parse"
            );
        }
    }

    #[test]
    fn iana_names_still_resolve() {
        assert_eq!(
            Timezone::parse("Europe/Berlin").unwrap(),
            Timezone::Iana(chrono_tz::Europe::Berlin)
        );
        assert_eq!(Timezone::parse(" UTC ").unwrap(), Timezone::Iana(Tz::UTC));
    }

    #[test]
    fn fixed_offsets_flip_the_written_sign() {
        let noon = utc(2025, 6, 1, 12, 0, 0);
        assert_eq!(offset("UTC0", noon), 0);
        assert_eq!(offset("HST10", noon), -10 * 3600);
        assert_eq!(offset("IST-5:30", noon), 5 * 3600 + 1800);
        assert_eq!(offset("<+0330>-3:30", noon), 3 * 3600 + 1800);
    }

    #[test]
    fn southern_hemisphere_daylight_wraps_the_year() {
        assert_eq!(offset(SYDNEY, utc(2025, 1, 15, 0, 0, 0)), 11 * 3600);
        assert_eq!(offset(SYDNEY, utc(2025, 7, 1, 0, 0, 0)), 10 * 3600);

        // first Sunday of October 2025 is the 5th, 02:00 AEST
        assert_eq!(offset(SYDNEY, utc(2025, 10, 4, 15, 59, 59)), 10 * 3600);
        assert_eq!(offset(SYDNEY, utc(2025, 10, 4, 16, 0, 0)), 11 * 3600);

        // first Sunday of April 2025 is the 6th, 03:00 AEDT
        assert_eq!(offset(SYDNEY, utc(2025, 4, 5, 15, 59, 59)), 11 * 3600);
        assert_eq!(offset(SYDNEY, utc(2025, 4, 5, 16, 0, 0)), 10 * 3600);
    }

    #[test]
    fn last_week_rule_picks_final_sunday() {
        // last Sunday of March 2025 is the 30th, 02:00 CET
        assert_eq!(offset(BERLIN, utc(2025, 3, 30, 0, 59, 59)), 3600);
        assert_eq!(offset(BERLIN, utc(2025, 3, 30, 1, 0, 0)), 7200);
        // last Sunday of October 2025 is the 26th, 03:00 CEST
        assert_eq!(offset(BERLIN, utc(2025, 10, 26, 0, 59, 59)), 7200);
        assert_eq!(offset(BERLIN, utc(2025, 10, 26, 1, 0, 0)), 3600);
    }

    #[test]
    fn local_time_applies_rule() {
        let zone = Timezone::parse(SYDNEY).unwrap();
        let local = zone.local(utc(2025, 1, 15, 0, 30, 0));
        assert_eq!(local.format("%H:%M:%S").to_string(), "11:30:00");
    }

    #[test]
    fn rejects_malformed_rules() {
        for text in [
            "",
            "Nowhere",
            "XY0",
            "AEST-10AEDT",
            "AEST-10AEDT,M13.1.0,M4.1.0",
            "AEST-10AEDT,M10.6.0,M4.1.0",
            "AEST-10AEDT,M10.1.7,M4.1.0",
            "AEST-25",
            "UTC0 trailing",
        ] {
            assert!(
                matches!(Timezone::parse(text), Err(DecodeError::InvalidTimezone(_))),
                "{text:?} was accepted"
            );
        }
    }
}
