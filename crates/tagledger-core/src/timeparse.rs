//! Natural-language and partial date/time resolution against an anchor instant.
//!
//! Every expression resolves relative to an explicit anchor (normally the
//! server clock) in the anchor's time zone. Relative offsets are measured from
//! the anchor instant itself; day-level expressions land on local midnight
//! unless a time of day is attached.

use std::cmp::Ordering;
use std::sync::OnceLock;

use chrono::{
    DateTime, Datelike, Days, Duration, LocalResult, Months, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Utc, Weekday,
};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{to_seconds, TimeWindow};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeParseError {
    #[error("could not parse time expression '{input}'")]
    Unparseable { input: String },
    #[error("ambiguous time expression '{input}': could be {}", .candidates.join(" or "))]
    Ambiguous {
        input: String,
        candidates: Vec<String>,
    },
    #[error("invalid time expression '{input}': {reason}")]
    Invalid { input: String, reason: String },
    #[error("'{input}' does not exist in the local time zone")]
    Nonexistent { input: String },
}

/// How to read `NN/NN` dates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateOrder {
    /// Infer from the values; fail when both readings are valid.
    #[default]
    Auto,
    MonthFirst,
    DayFirst,
}

impl DateOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            DateOrder::Auto => "auto",
            DateOrder::MonthFirst => "month_first",
            DateOrder::DayFirst => "day_first",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "auto" => Some(Self::Auto),
            "month_first" | "mdy" => Some(Self::MonthFirst),
            "day_first" | "dmy" => Some(Self::DayFirst),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverOptions {
    pub date_order: DateOrder,
}

/// Resolve `input` to an instant in the anchor's time zone.
pub fn resolve<Tz: TimeZone>(
    input: &str,
    anchor: &DateTime<Tz>,
    options: &ResolverOptions,
) -> Result<DateTime<Tz>, TimeParseError> {
    let raw = input.trim();
    if raw.is_empty() {
        return Err(unparseable(input));
    }
    let tz = anchor.timezone();

    if let Some(parsed) = parse_rfc3339(raw) {
        return Ok(parsed.with_timezone(&tz));
    }

    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();

    if unix_re().is_match(&text) {
        let secs = text
            .parse::<i64>()
            .map_err(|_| invalid(input, "timestamp out of range"))?;
        return Utc
            .timestamp_opt(secs, 0)
            .single()
            .map(|at| at.with_timezone(&tz))
            .ok_or_else(|| invalid(input, "timestamp out of range"));
    }

    if text == "now" {
        return Ok(anchor.clone());
    }

    if let Some(offset) = parse_relative(&text) {
        return apply_offset(anchor, offset).ok_or_else(|| invalid(input, "offset out of range"));
    }

    let text = iso_t_re().replace(&text, "$1 $2").into_owned();
    let (date_part, time) = split_time_of_day(&text, input)?;
    let anchor_date = anchor.date_naive();
    let date = if date_part.is_empty() {
        if time.is_none() {
            return Err(unparseable(input));
        }
        anchor_date
    } else {
        parse_date(&date_part, anchor_date, options, input)?
    };

    let naive = date.and_time(time.unwrap_or(NaiveTime::MIN));
    localize(&tz, naive, input)
}

/// Resolve in `tz` against a UTC anchor and return a UTC instant (whole seconds).
pub fn resolve_instant<Tz: TimeZone>(
    input: &str,
    anchor: DateTime<Utc>,
    tz: &Tz,
    options: &ResolverOptions,
) -> Result<DateTime<Utc>, TimeParseError> {
    let local_anchor = anchor.with_timezone(tz);
    resolve(input, &local_anchor, options).map(|at| to_seconds(at.with_timezone(&Utc)))
}

/// Lower bound used when no start expression is given.
pub fn default_range_start() -> DateTime<Utc> {
    Utc.timestamp_opt(946_684_800, 0).single().unwrap_or_default()
}

/// Resolve an optional `--start`/`--end` pair into a window.
pub fn resolve_range<Tz: TimeZone>(
    start: Option<&str>,
    end: Option<&str>,
    anchor: DateTime<Utc>,
    tz: &Tz,
    options: &ResolverOptions,
) -> Result<TimeWindow, TimeParseError> {
    let start_at = match start {
        Some(text) => resolve_instant(text, anchor, tz, options)?,
        None => default_range_start(),
    };
    let end_at = match end {
        Some(text) => resolve_instant(text, anchor, tz, options)?,
        None => anchor + Duration::days(1),
    };
    if end_at <= start_at {
        return Err(TimeParseError::Invalid {
            input: format!("{} .. {}", start.unwrap_or(""), end.unwrap_or("")),
            reason: format!("end {} is not after start {}", end_at, start_at),
        });
    }
    Ok(TimeWindow::new(start_at, end_at))
}

fn unparseable(input: &str) -> TimeParseError {
    TimeParseError::Unparseable {
        input: input.to_string(),
    }
}

fn invalid(input: &str, reason: &str) -> TimeParseError {
    TimeParseError::Invalid {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

fn unix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[+-]?\d{9,}$").expect("unix regex"))
}

fn iso_t_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{4}-\d{1,2}-\d{1,2})t(\d)").expect("iso regex"))
}

fn offset_term_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<amount>\d+|an|a|one)\s*(?P<unit>[a-z]+)").expect("offset regex")
    })
}

fn time_of_day_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<rest>.*?)\s*,?\s*(?:at\s+|@\s*)?(?P<time>(?P<h>\d{1,2}):(?P<m>\d{2})(?::(?P<s>\d{2}))?\s*(?P<ap>am|pm)?|(?P<h2>\d{1,2})\s*(?P<ap2>am|pm)|noon|midnight)$",
        )
        .expect("time regex")
    })
}

fn weekday_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:(?P<modifier>last|next|this|past|coming)\s+)?(?P<day>[a-z]+)\.?$")
            .expect("weekday regex")
    })
}

fn iso_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<y>\d{4})[-/.](?P<m>\d{1,2})[-/.](?P<d>\d{1,2})$").expect("date regex")
    })
}

fn slash_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<a>\d{1,2})[/.](?P<b>\d{1,2})(?:[/.](?P<y>\d{4}))?$")
            .expect("slash regex")
    })
}

fn month_day_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<month>[a-z]+)\.?\s+(?P<day>\d{1,2})(?:st|nd|rd|th)?(?:,?\s+(?P<y>\d{4}))?$",
        )
        .expect("month-day regex")
    })
}

fn day_month_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<day>\d{1,2})(?:st|nd|rd|th)?\s+(?:of\s+)?(?P<month>[a-z]+)\.?(?:,?\s+(?P<y>\d{4}))?$",
        )
        .expect("day-month regex")
    })
}

fn parse_rfc3339(raw: &str) -> Option<DateTime<chrono::FixedOffset>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed);
    }
    // Accept a space instead of `T` between date and time.
    let (date, time) = raw.split_once(' ')?;
    DateTime::parse_from_rfc3339(&format!("{}T{}", date, time.trim())).ok()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Offset {
    months: i32,
    seconds: i64,
}

impl Offset {
    fn negate(self) -> Self {
        Self {
            months: -self.months,
            seconds: -self.seconds,
        }
    }
}

enum Unit {
    Seconds(i64),
    Months(i64),
}

fn unit_kind(unit: &str) -> Option<Unit> {
    let kind = match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => Unit::Seconds(1),
        "m" | "min" | "mins" | "minute" | "minutes" => Unit::Seconds(60),
        "h" | "hr" | "hrs" | "hour" | "hours" => Unit::Seconds(3_600),
        "d" | "day" | "days" => Unit::Seconds(86_400),
        "w" | "wk" | "wks" | "week" | "weeks" => Unit::Seconds(604_800),
        "mo" | "mos" | "month" | "months" => Unit::Months(1),
        "y" | "yr" | "yrs" | "year" | "years" => Unit::Months(12),
        _ => return None,
    };
    Some(kind)
}

fn parse_relative(text: &str) -> Option<Offset> {
    if let Some(rest) = text.strip_prefix("in ") {
        return parse_offset_terms(rest);
    }
    if let Some(rest) = text.strip_suffix(" ago") {
        return parse_offset_terms(rest).map(Offset::negate);
    }
    if let Some(rest) = text.strip_prefix('+') {
        return parse_offset_terms(rest);
    }
    if let Some(rest) = text.strip_prefix('-') {
        return parse_offset_terms(rest).map(Offset::negate);
    }
    None
}

fn parse_offset_terms(text: &str) -> Option<Offset> {
    let mut rest = text.trim();
    let mut offset = Offset::default();
    let mut terms = 0;
    while !rest.is_empty() {
        let caps = offset_term_re().captures(rest)?;
        let amount = match &caps["amount"] {
            "a" | "an" | "one" => 1,
            digits => digits.parse::<i64>().ok()?,
        };
        match unit_kind(&caps["unit"])? {
            Unit::Seconds(mult) => {
                offset.seconds = offset.seconds.checked_add(amount.checked_mul(mult)?)?;
            }
            Unit::Months(mult) => {
                let months = i32::try_from(amount.checked_mul(mult)?).ok()?;
                offset.months = offset.months.checked_add(months)?;
            }
        }
        terms += 1;
        rest = rest[caps.get(0)?.end()..].trim_start();
        rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
        if let Some(after) = rest.strip_prefix("and ") {
            rest = after.trim_start();
        }
    }
    if terms == 0 {
        None
    } else {
        Some(offset)
    }
}

fn apply_offset<Tz: TimeZone>(anchor: &DateTime<Tz>, offset: Offset) -> Option<DateTime<Tz>> {
    let shifted = match offset.months.cmp(&0) {
        Ordering::Greater => anchor
            .clone()
            .checked_add_months(Months::new(offset.months.unsigned_abs()))?,
        Ordering::Less => anchor
            .clone()
            .checked_sub_months(Months::new(offset.months.unsigned_abs()))?,
        Ordering::Equal => anchor.clone(),
    };
    shifted.checked_add_signed(Duration::try_seconds(offset.seconds)?)
}

fn split_time_of_day(
    text: &str,
    input: &str,
) -> Result<(String, Option<NaiveTime>), TimeParseError> {
    let Some(caps) = time_of_day_re().captures(text) else {
        return Ok((text.trim().to_string(), None));
    };
    let rest = caps
        .name("rest")
        .map(|m| m.as_str().trim().trim_end_matches(',').trim())
        .unwrap_or("")
        .to_string();
    let time = time_from_caps(&caps, input)?;
    Ok((rest, Some(time)))
}

fn time_from_caps(caps: &Captures<'_>, input: &str) -> Result<NaiveTime, TimeParseError> {
    match &caps["time"] {
        "noon" => return Ok(NaiveTime::from_hms_opt(12, 0, 0).unwrap_or(NaiveTime::MIN)),
        "midnight" => return Ok(NaiveTime::MIN),
        _ => {}
    }
    let number = |name: &str| -> u32 {
        caps.name(name)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .unwrap_or(0)
    };
    let (hour, minute, second, meridiem) = if caps.name("h").is_some() {
        (
            number("h"),
            number("m"),
            number("s"),
            caps.name("ap").map(|m| m.as_str()),
        )
    } else {
        (number("h2"), 0, 0, caps.name("ap2").map(|m| m.as_str()))
    };
    let hour = match meridiem {
        Some(meridiem) => {
            if hour == 0 || hour > 12 {
                return Err(invalid(input, "hour must be between 1 and 12 with am/pm"));
            }
            let base = hour % 12;
            if meridiem == "pm" {
                base + 12
            } else {
                base
            }
        }
        None => hour,
    };
    NaiveTime::from_hms_opt(hour, minute, second)
        .ok_or_else(|| invalid(input, "time of day out of range"))
}

fn parse_date(
    text: &str,
    anchor_date: NaiveDate,
    options: &ResolverOptions,
    input: &str,
) -> Result<NaiveDate, TimeParseError> {
    match text {
        "today" => return Ok(anchor_date),
        "yesterday" => {
            return anchor_date
                .pred_opt()
                .ok_or_else(|| invalid(input, "date out of range"))
        }
        "tomorrow" => {
            return anchor_date
                .succ_opt()
                .ok_or_else(|| invalid(input, "date out of range"))
        }
        _ => {}
    }

    if let Some(caps) = weekday_re().captures(text) {
        if let Some(weekday) = weekday_from_name(&caps["day"]) {
            let modifier = caps.name("modifier").map(|m| m.as_str()).unwrap_or("this");
            return shift_to_weekday(anchor_date, weekday, modifier)
                .ok_or_else(|| invalid(input, "date out of range"));
        }
    }

    if let Some(caps) = iso_date_re().captures(text) {
        let year = caps["y"].parse::<i32>().map_err(|_| unparseable(input))?;
        let month = caps["m"].parse::<u32>().map_err(|_| unparseable(input))?;
        let day = caps["d"].parse::<u32>().map_err(|_| unparseable(input))?;
        return NaiveDate::from_ymd_opt(year, month, day)
            .ok_or_else(|| invalid(input, "no such calendar day"));
    }

    if let Some(caps) = slash_date_re().captures(text) {
        let a = caps["a"].parse::<u32>().map_err(|_| unparseable(input))?;
        let b = caps["b"].parse::<u32>().map_err(|_| unparseable(input))?;
        let year = caps.name("y").and_then(|m| m.as_str().parse::<i32>().ok());
        let (month, day) = order_slash(a, b, options.date_order, year, input)?;
        return match year {
            Some(year) => NaiveDate::from_ymd_opt(year, month, day)
                .ok_or_else(|| invalid(input, "no such calendar day")),
            None => most_recent(month, day, anchor_date, input),
        };
    }

    for caps in [month_day_re().captures(text), day_month_re().captures(text)]
        .into_iter()
        .flatten()
    {
        let Some(month) = month_from_name(&caps["month"]) else {
            continue;
        };
        let day = caps["day"].parse::<u32>().map_err(|_| unparseable(input))?;
        let year = caps.name("y").and_then(|m| m.as_str().parse::<i32>().ok());
        return match year {
            Some(year) => NaiveDate::from_ymd_opt(year, month, day)
                .ok_or_else(|| invalid(input, "no such calendar day")),
            None => most_recent(month, day, anchor_date, input),
        };
    }

    Err(unparseable(input))
}

fn order_slash(
    a: u32,
    b: u32,
    order: DateOrder,
    year: Option<i32>,
    input: &str,
) -> Result<(u32, u32), TimeParseError> {
    match order {
        DateOrder::MonthFirst => Ok((a, b)),
        DateOrder::DayFirst => Ok((b, a)),
        DateOrder::Auto => match (a <= 12, b <= 12) {
            (true, true) if a != b => {
                let render = |month: u32, day: u32| match year {
                    Some(year) => format!("{:04}-{:02}-{:02}", year, month, day),
                    None => format!("--{:02}-{:02}", month, day),
                };
                Err(TimeParseError::Ambiguous {
                    input: input.to_string(),
                    candidates: vec![render(a, b), render(b, a)],
                })
            }
            (true, _) => Ok((a, b)),
            (false, true) => Ok((b, a)),
            (false, false) => Err(invalid(input, "neither part is a valid month")),
        },
    }
}

/// Latest occurrence of `month`/`day` on or before `anchor_date`.
fn most_recent(
    month: u32,
    day: u32,
    anchor_date: NaiveDate,
    input: &str,
) -> Result<NaiveDate, TimeParseError> {
    let year = anchor_date.year();
    // Eight years always include a leap year.
    for candidate_year in (year - 8..=year).rev() {
        if let Some(date) = NaiveDate::from_ymd_opt(candidate_year, month, day) {
            if date <= anchor_date {
                return Ok(date);
            }
        }
    }
    Err(invalid(input, "no such calendar day"))
}

fn shift_to_weekday(anchor_date: NaiveDate, target: Weekday, modifier: &str) -> Option<NaiveDate> {
    let current = i64::from(anchor_date.weekday().num_days_from_monday());
    let wanted = i64::from(target.num_days_from_monday());
    match modifier {
        "last" | "past" => {
            let back = match (current - wanted).rem_euclid(7) {
                0 => 7,
                n => n,
            };
            anchor_date.checked_sub_days(Days::new(back as u64))
        }
        "next" | "coming" => {
            let forward = match (wanted - current).rem_euclid(7) {
                0 => 7,
                n => n,
            };
            anchor_date.checked_add_days(Days::new(forward as u64))
        }
        _ => {
            let back = (current - wanted).rem_euclid(7);
            anchor_date.checked_sub_days(Days::new(back as u64))
        }
    }
}

fn weekday_from_name(name: &str) -> Option<Weekday> {
    let day = match name {
        "monday" | "mon" => Weekday::Mon,
        "tuesday" | "tue" | "tues" => Weekday::Tue,
        "wednesday" | "wed" => Weekday::Wed,
        "thursday" | "thu" | "thur" | "thurs" => Weekday::Thu,
        "friday" | "fri" => Weekday::Fri,
        "saturday" | "sat" => Weekday::Sat,
        "sunday" | "sun" => Weekday::Sun,
        _ => return None,
    };
    Some(day)
}

fn month_from_name(name: &str) -> Option<u32> {
    let month = match name {
        "january" | "jan" => 1,
        "february" | "feb" => 2,
        "march" | "mar" => 3,
        "april" | "apr" => 4,
        "may" => 5,
        "june" | "jun" => 6,
        "july" | "jul" => 7,
        "august" | "aug" => 8,
        "september" | "sep" | "sept" => 9,
        "october" | "oct" => 10,
        "november" | "nov" => 11,
        "december" | "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn localize<Tz: TimeZone>(
    tz: &Tz,
    naive: NaiveDateTime,
    input: &str,
) -> Result<DateTime<Tz>, TimeParseError> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(at) => Ok(at),
        LocalResult::Ambiguous(first, second) => Err(TimeParseError::Ambiguous {
            input: input.to_string(),
            candidates: vec![
                format!("{} UTC", first.naive_utc()),
                format!("{} UTC", second.naive_utc()),
            ],
        }),
        LocalResult::None => Err(TimeParseError::Nonexistent {
            input: input.to_string(),
        }),
    }
}
