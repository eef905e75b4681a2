use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{Record, TimeWindow};

/// How a list of tags is matched against a record.
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TagMatch {
    #[default]
    Any,
    All,
}

impl TagMatch {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "any" => Some(TagMatch::Any),
            "all" => Some(TagMatch::All),
            _ => None,
        }
    }
}

/// Empty `tags` matches every record.
pub fn matches_tags(record: &Record, tags: &[String], mode: TagMatch) -> bool {
    if tags.is_empty() {
        return true;
    }
    match mode {
        TagMatch::Any => tags.iter().any(|tag| record.has_tag(tag)),
        TagMatch::All => tags.iter().all(|tag| record.has_tag(tag)),
    }
}

pub fn filter_by_tags(records: &[Record], tags: &[String], mode: TagMatch) -> Vec<Record> {
    records
        .iter()
        .filter(|record| matches_tags(record, tags, mode))
        .cloned()
        .collect()
}

/// Time spent inside `window` by visible records.
pub fn total_time(records: &[Record], window: &TimeWindow, now: DateTime<Utc>) -> Duration {
    records
        .iter()
        .filter(|record| !record.hidden)
        .map(|record| {
            let end = if record.is_running() { now } else { record.t_stop };
            let clipped = end.min(window.end) - record.t_start.max(window.start);
            clipped.max(Duration::zero())
        })
        .fold(Duration::zero(), |acc, d| acc + d)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagStat {
    pub tag: String,
    pub count: usize,
    pub total_secs: i64,
}

/// Per-tag record count and total duration, longest first.
pub fn tag_stats(records: &[Record], now: DateTime<Utc>) -> Vec<TagStat> {
    let mut by_tag: BTreeMap<String, (usize, i64)> = BTreeMap::new();
    for record in records.iter().filter(|record| !record.hidden) {
        let secs = record.duration(now).num_seconds();
        for tag in record.tags() {
            let entry = by_tag.entry(tag.to_lowercase()).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += secs;
        }
    }
    let mut stats: Vec<TagStat> = by_tag
        .into_iter()
        .map(|(tag, (count, total_secs))| TagStat {
            tag,
            count,
            total_secs,
        })
        .collect();
    stats.sort_by(|a, b| b.total_secs.cmp(&a.total_secs).then_with(|| a.tag.cmp(&b.tag)));
    stats
}

/// Local day, Monday-based week and month containing an instant.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CalendarPeriods {
    pub today: TimeWindow,
    pub week: TimeWindow,
    pub month: TimeWindow,
}

impl CalendarPeriods {
    pub fn containing<Tz: TimeZone>(now: DateTime<Utc>, tz: &Tz) -> Option<Self> {
        let today = now.with_timezone(tz).date_naive();
        let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
        let first = today.with_day(1)?;
        let next_month = if first.month() == 12 {
            NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)?
        } else {
            first.with_month(first.month() + 1)?
        };
        Some(Self {
            today: day_span(tz, today, today.succ_opt()?)?,
            week: day_span(tz, monday, monday + Duration::days(7))?,
            month: day_span(tz, first, next_month)?,
        })
    }

    /// Smallest window holding all three periods; a week can start in the
    /// previous month.
    pub fn covering(&self) -> TimeWindow {
        TimeWindow::new(
            self.week.start.min(self.month.start),
            self.week.end.max(self.month.end),
        )
    }
}

fn day_span<Tz: TimeZone>(tz: &Tz, from: NaiveDate, to: NaiveDate) -> Option<TimeWindow> {
    Some(TimeWindow::new(start_of_day(tz, from)?, start_of_day(tz, to)?))
}

/// First local instant of `date`. A DST gap at midnight moves it later.
fn start_of_day<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> Option<DateTime<Utc>> {
    (0..3).find_map(|hour| {
        let naive = date.and_hms_opt(hour, 0, 0)?;
        tz.from_local_datetime(&naive)
            .earliest()
            .map(|at| at.with_timezone(&Utc))
    })
}

/// Totals for today, this week and this month plus what is running now.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusReport {
    pub now: DateTime<Utc>,
    pub periods: CalendarPeriods,
    pub today_secs: i64,
    pub week_secs: i64,
    pub month_secs: i64,
    pub running: Vec<Record>,
    /// Visible records touching today, oldest first.
    pub today_records: Vec<Record>,
}

impl StatusReport {
    pub fn build(
        records: &[Record],
        running: Vec<Record>,
        periods: CalendarPeriods,
        now: DateTime<Utc>,
    ) -> Self {
        let mut today_records: Vec<Record> = records
            .iter()
            .filter(|record| !record.hidden && periods.today.touches(record))
            .cloned()
            .collect();
        today_records.sort_by(|a, b| a.t_start.cmp(&b.t_start).then_with(|| a.key.cmp(&b.key)));
        Self {
            now,
            periods,
            today_secs: total_time(records, &periods.today, now).num_seconds(),
            week_secs: total_time(records, &periods.week, now).num_seconds(),
            month_secs: total_time(records, &periods.month, now).num_seconds(),
            running,
            today_records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 12, h, 0, 0).unwrap()
    }

    fn rec(description: &str, start: u32, stop: u32) -> Record {
        Record {
            key: format!("k{start}"),
            description: description.to_string(),
            t_start: at(start),
            t_stop: at(stop),
            modified_at: at(start),
            hidden: false,
        }
    }

    #[test]
    fn tag_matching_modes() {
        let record = rec("call #client #Billing", 9, 10);
        let tags = vec!["client".to_string(), "#billing".to_string()];
        assert!(matches_tags(&record, &tags, TagMatch::All));
        let tags = vec!["#client".to_string(), "#other".to_string()];
        assert!(matches_tags(&record, &tags, TagMatch::Any));
        assert!(!matches_tags(&record, &tags, TagMatch::All));
        assert!(matches_tags(&record, &[], TagMatch::All));
    }

    #[test]
    fn total_time_clips_to_window_and_measures_running_to_now() {
        let records = vec![rec("a", 8, 10), rec("b", 11, 11)];
        let window = TimeWindow::new(at(9), at(20));
        assert_eq!(total_time(&records, &window, at(13)), Duration::hours(3));
    }

    #[test]
    fn tag_stats_sorted_by_duration() {
        let records = vec![rec("#a #b", 8, 9), rec("#b", 10, 12), rec("#c", 13, 14)];
        let stats = tag_stats(&records, at(20));
        let tags: Vec<(&str, usize, i64)> = stats
            .iter()
            .map(|s| (s.tag.as_str(), s.count, s.total_secs))
            .collect();
        assert_eq!(
            tags,
            vec![("#b", 2, 3 * 3600), ("#a", 1, 3600), ("#c", 1, 3600)]
        );
    }

    #[test]
    fn calendar_periods_follow_the_local_calendar() {
        let periods = CalendarPeriods::containing(at(14), &Utc).expect("periods");
        assert_eq!(periods.today, TimeWindow::new(at(0), at(0) + Duration::days(1)));
        assert_eq!(
            periods.week.start,
            Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap()
        );
        assert_eq!(periods.week.end - periods.week.start, Duration::days(7));
        assert_eq!(
            periods.month,
            TimeWindow::new(
                Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap()
            )
        );

        // 23:30 UTC is already Thursday in UTC+2.
        let plus_two = chrono::FixedOffset::east_opt(2 * 3600).expect("offset");
        let late = Utc.with_ymd_and_hms(2025, 3, 12, 23, 30, 0).unwrap();
        let periods = CalendarPeriods::containing(late, &plus_two).expect("periods");
        assert_eq!(
            periods.today.start,
            Utc.with_ymd_and_hms(2025, 3, 12, 22, 0, 0).unwrap()
        );

        let december = Utc.with_ymd_and_hms(2025, 12, 31, 10, 0, 0).unwrap();
        let periods = CalendarPeriods::containing(december, &Utc).expect("periods");
        assert_eq!(
            periods.month.end,
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(periods.covering().end, periods.week.end);
    }

    #[test]
    fn status_report_totals_each_period() {
        let monday = Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap();
        let mut hidden = rec("#dev hidden", 8, 9);
        hidden.hidden = true;
        let records = vec![
            rec("#dev today", 9, 10),
            rec("#dev running", 11, 11),
            Record {
                key: "monday".to_string(),
                t_start: monday,
                t_stop: monday + Duration::hours(2),
                ..rec("#dev monday", 9, 10)
            },
            Record {
                key: "early".to_string(),
                t_start: early,
                t_stop: early + Duration::hours(4),
                ..rec("#ops early", 9, 10)
            },
            hidden,
        ];
        let periods = CalendarPeriods::containing(at(12), &Utc).expect("periods");
        let running = vec![records[1].clone()];
        let report = StatusReport::build(&records, running, periods, at(12));
        assert_eq!(report.today_secs, 2 * 3600);
        assert_eq!(report.week_secs, 4 * 3600);
        assert_eq!(report.month_secs, 8 * 3600);
        let today: Vec<&str> = report
            .today_records
            .iter()
            .map(|record| record.description.as_str())
            .collect();
        assert_eq!(today, vec!["#dev today", "#dev running"]);
    }
}
