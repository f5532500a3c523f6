use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::KernelError;

const DAYS_IN_MONTH: [u8; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// Three-valued attribute state. There is deliberately no `From<TriState> for bool`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriState {
    True,
    False,
    #[default]
    Unknown,
}

impl TriState {
    #[must_use]
    pub fn from_option(value: Option<bool>) -> Self {
        match value {
            Some(true) => Self::True,
            Some(false) => Self::False,
            None => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_option(self) -> Option<bool> {
        match self {
            Self::True => Some(true),
            Self::False => Some(false),
            Self::Unknown => None,
        }
    }

    #[must_use]
    pub fn is_true(self) -> bool {
        self == Self::True
    }

    #[must_use]
    pub fn is_false(self) -> bool {
        self == Self::False
    }

    #[must_use]
    pub fn is_unknown(self) -> bool {
        self == Self::Unknown
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::True => "true",
            Self::False => "false",
            Self::Unknown => "unknown",
        }
    }
}

impl Display for TriState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A calendar position. Leap years are ignored; Feb 29 is always a valid position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "MonthDayRepr", into = "MonthDayRepr")]
pub struct MonthDay {
    month: u8,
    day: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct MonthDayRepr {
    month: u8,
    day: u8,
}

impl TryFrom<MonthDayRepr> for MonthDay {
    type Error = KernelError;

    fn try_from(value: MonthDayRepr) -> Result<Self, Self::Error> {
        Self::new(value.month, value.day)
    }
}

impl From<MonthDay> for MonthDayRepr {
    fn from(value: MonthDay) -> Self {
        Self { month: value.month, day: value.day }
    }
}

impl MonthDay {
    pub const JAN_1: Self = Self { month: 1, day: 1 };
    pub const DEC_31: Self = Self { month: 12, day: 31 };

    /// # Errors
    /// Returns [`KernelError::Validation`] when the month or day is out of calendar range.
    pub fn new(month: u8, day: u8) -> Result<Self, KernelError> {
        if !(1..=12).contains(&month) {
            return Err(KernelError::Validation(format!("month {month} is out of range")));
        }
        let max_day = DAYS_IN_MONTH[usize::from(month - 1)];
        if day == 0 || day > max_day {
            return Err(KernelError::Validation(format!(
                "day {day} is out of range for month {month}"
            )));
        }
        Ok(Self { month, day })
    }

    #[must_use]
    pub fn month(self) -> u8 {
        self.month
    }

    #[must_use]
    pub fn day(self) -> u8 {
        self.day
    }

    /// `month * 100 + day`; orders identically to the `(month, day)` tuple.
    #[must_use]
    pub fn ordinal(self) -> u16 {
        u16::from(self.month) * 100 + u16::from(self.day)
    }

    #[must_use]
    pub fn from_date(date: time::Date) -> Self {
        Self { month: u8::from(date.month()), day: date.day() }
    }
}

impl Display for MonthDay {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}-{:02}", self.month, self.day)
    }
}

/// One seasonal availability window as stored in the catalog; any field may be absent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct SeasonRange {
    pub start_month: Option<u8>,
    pub start_day: Option<u8>,
    pub end_month: Option<u8>,
    pub end_day: Option<u8>,
}

impl SeasonRange {
    #[must_use]
    pub fn new(start: MonthDay, end: MonthDay) -> Self {
        Self {
            start_month: Some(start.month),
            start_day: Some(start.day),
            end_month: Some(end.month),
            end_day: Some(end.day),
        }
    }

    /// The validated endpoints, or `None` when the range carries no usable data.
    #[must_use]
    pub fn bounds(&self) -> Option<(MonthDay, MonthDay)> {
        let start = MonthDay::new(self.start_month?, self.start_day?).ok()?;
        let end = MonthDay::new(self.end_month?, self.end_day?).ok()?;
        Some((start, end))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start_month.is_none()
            && self.start_day.is_none()
            && self.end_month.is_none()
            && self.end_day.is_none()
    }

    #[must_use]
    pub fn is_wrapping(&self) -> bool {
        self.bounds().is_some_and(|(start, end)| start > end)
    }

    #[must_use]
    pub fn contains(&self, target: MonthDay) -> bool {
        self.bounds().is_some_and(|(start, end)| range_contains(start, end, target))
    }

    fn is_full_calendar(&self) -> bool {
        self.bounds() == Some((MonthDay::JAN_1, MonthDay::DEC_31))
    }
}

fn range_contains(start: MonthDay, end: MonthDay, target: MonthDay) -> bool {
    if start <= end {
        start <= target && target <= end
    } else {
        target >= start || target <= end
    }
}

/// Whether any usable range contains `target`. Unusable ranges are skipped.
#[must_use]
pub fn is_available(ranges: &[SeasonRange], target: MonthDay) -> bool {
    ranges.iter().any(|range| range.contains(target))
}

#[must_use]
pub fn has_usable_range(ranges: &[SeasonRange]) -> bool {
    ranges.iter().any(|range| range.bounds().is_some())
}

/// Year-round classification: an explicit `true` flag or one Jan 1..Dec 31 range is
/// year-round; no ranges and no flag is unknown; anything else is seasonal.
#[must_use]
pub fn is_year_round(ranges: &[SeasonRange], explicit_flag: Option<bool>) -> TriState {
    if explicit_flag == Some(true) || ranges.iter().any(SeasonRange::is_full_calendar) {
        return TriState::True;
    }
    if explicit_flag.is_none() && !has_usable_range(ranges) {
        return TriState::Unknown;
    }
    TriState::False
}

/// Availability on `target`, keeping "no data" distinct from "not in season".
#[must_use]
pub fn availability(ranges: &[SeasonRange], year_round: TriState, target: MonthDay) -> TriState {
    if year_round.is_true() || is_available(ranges, target) {
        return TriState::True;
    }
    if has_usable_range(ranges) {
        TriState::False
    } else {
        TriState::Unknown
    }
}
