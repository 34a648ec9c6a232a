use chrono::{DateTime, Datelike, Days, NaiveDate, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

const WINDOW_DATE_FORMAT: &str = "%Y.%m.%d";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: u64,
    pub label: String,
}

impl GroupRecord {
    pub fn new<L: Into<String>>(id: u64, label: L) -> Self {
        GroupRecord {
            id,
            label: label.into(),
        }
    }
}

/// The persisted `groups_index.json` document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupIndexSnapshot {
    pub updated_at: DateTime<Utc>,
    pub source: String,
    pub count: usize,
    pub items: Vec<GroupRecord>,
}

impl GroupIndexSnapshot {
    /// Sorts `items` case-insensitively by label and stamps the current time.
    pub fn new<S: Into<String>>(source: S, mut items: Vec<GroupRecord>) -> Self {
        items.sort_by_cached_key(|record| record.label.to_lowercase());

        GroupIndexSnapshot {
            updated_at: Utc::now().trunc_subsecs(0),
            source: source.into(),
            count: items.len(),
            items,
        }
    }
}

/// Date range for schedule lookups, rendered as `YYYY.MM.DD`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduleWindow {
    pub start: NaiveDate,
    pub finish: NaiveDate,
}

impl ScheduleWindow {
    /// A window of `weeks` weeks (at least one) starting on the Monday of the
    /// week containing `day`.
    pub fn weeks_from(day: NaiveDate, weeks: u32) -> Self {
        let start = day - Days::new(u64::from(day.weekday().num_days_from_monday()));
        let finish = start + Days::new(7 * u64::from(weeks.max(1)));
        ScheduleWindow { start, finish }
    }

    /// Same as [`ScheduleWindow::weeks_from`] for the current UTC date.
    pub fn current(weeks: u32) -> Self {
        Self::weeks_from(Utc::now().date_naive(), weeks)
    }

    pub fn start_param(&self) -> String {
        self.start.format(WINDOW_DATE_FORMAT).to_string()
    }

    pub fn finish_param(&self) -> String {
        self.finish.format(WINDOW_DATE_FORMAT).to_string()
    }
}
