//! Monthly reporting periods (`YYYYMM`).

use std::fmt;

use chrono::{Datelike, NaiveDate};

use crate::{Error, Result, window::Moment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month {
  pub year:  i32,
  pub month: u32,
}

impl Month {
  pub fn of(date: NaiveDate) -> Self { Self { year: date.year(), month: date.month() } }

  /// Accepts `YYYYMM`, `YYYY-MM`, `YYYYMMDD`, `YYYY-MM-DD` or an ISO 8601
  /// date-time.
  pub fn parse(input: &str) -> Result<Self> {
    let s = input.trim();
    let invalid = || Error::InvalidPeriod(input.to_owned());

    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    let compact = !s.contains('T') && !s.contains(' ');
    let month = match (compact, digits.len()) {
      (true, 6) => {
        let year = digits[..4].parse().map_err(|_| invalid())?;
        let month = digits[4..].parse().map_err(|_| invalid())?;
        Month { year, month }
      }
      (true, 8) => NaiveDate::parse_from_str(&digits, "%Y%m%d")
        .map(Month::of)
        .map_err(|_| invalid())?,
      _ => match Moment::parse(s).map_err(|_| invalid())? {
        Moment::Date(d) => Month::of(d),
        Moment::DateTime(dt) => Month::of(dt.date()),
      },
    };

    if (1..=12).contains(&month.month) { Ok(month) } else { Err(invalid()) }
  }

  pub fn previous(self) -> Self {
    if self.month == 1 {
      Month { year: self.year - 1, month: 12 }
    } else {
      Month { year: self.year, month: self.month - 1 }
    }
  }

  pub fn next(self) -> Self {
    if self.month == 12 {
      Month { year: self.year + 1, month: 1 }
    } else {
      Month { year: self.year, month: self.month + 1 }
    }
  }
}

impl fmt::Display for Month {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:04}{:02}", self.year, self.month)
  }
}

/// The month before the one containing `date`, as `YYYYMM`.
pub fn previous_month(date: NaiveDate) -> String { Month::of(date).previous().to_string() }

/// Every month between `start` and `end` inclusive, in ascending order.
/// The bounds may be given in either order.
pub fn period_range(start: &str, end: &str) -> Result<Vec<String>> {
  let (a, b) = (Month::parse(start)?, Month::parse(end)?);
  let (mut cur, last) = if a <= b { (a, b) } else { (b, a) };

  let mut out = Vec::new();
  while cur <= last {
    out.push(cur.to_string());
    cur = cur.next();
  }
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn previous_month_wraps_the_year() {
    let jan = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
    assert_eq!(previous_month(jan), "202312");
    let jul = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
    assert_eq!(previous_month(jul), "202406");
  }

  #[test]
  fn range_is_inclusive_and_order_insensitive() {
    let fwd = period_range("2023-11", "202402").unwrap();
    assert_eq!(fwd, ["202311", "202312", "202401", "202402"]);
    assert_eq!(period_range("2024-02-10", "2023-11-01").unwrap(), fwd);
  }

  #[test]
  fn single_month_range() {
    assert_eq!(period_range("202405", "202405").unwrap(), ["202405"]);
  }

  #[test]
  fn bad_periods_are_rejected() {
    assert!(matches!(Month::parse("202413"), Err(Error::InvalidPeriod(_))));
    assert!(Month::parse("soon").is_err());
  }

  #[test]
  fn datetimes_are_accepted() {
    assert_eq!(Month::parse("2024-03-31T23:00:00Z").unwrap(), Month { year: 2024, month: 3 });
  }
}
