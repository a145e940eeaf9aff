//! Instants, clocks and the parsers for remote timestamps.
//!
//! Remote modification times come in two flavors: HTTP `Last-Modified` headers and the date
//! columns of FTP `LIST` output. Both are normalized to a [`Timestamp`] in UTC with second
//! resolution, so that they can be compared with local file times and with each other.

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

/// An instant in UTC.
pub type Timestamp = DateTime<Utc>;

/// The source of "now" for freshness decisions.
///
/// Everything that compares against the current time takes a clock, so that expiry and year
/// inference can be tested deterministically.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> Timestamp;
}

/// The wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        truncate_to_second(Utc::now())
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Sets the current instant.
    pub fn set(&self, now: Timestamp) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Errors parsing remote metadata.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ListingError {
    /// A listing row that does not split into the `ls -l` columns.
    #[error("malformed listing line: {0:?}")]
    MalformedListing(String),
    /// A date header in none of the known formats.
    #[error("invalid date: {0:?}")]
    InvalidDate(String),
}

/// Drops sub-second precision.
pub fn truncate_to_second(time: Timestamp) -> Timestamp {
    Utc.timestamp_opt(time.timestamp(), 0)
        .single()
        .unwrap_or(time)
}

/// Converts a file system time to a [`Timestamp`].
pub fn from_system_time(time: SystemTime) -> Timestamp {
    truncate_to_second(DateTime::<Utc>::from(time))
}

/// Parses an HTTP date.
///
/// The preferred format is RFC 1123 (`Sun, 06 Nov 1994 08:49:37 GMT`). The obsolete RFC 850
/// (`Sunday, 06-Nov-94 08:49:37 GMT`) and asctime (`Sun Nov  6 08:49:37 1994`) forms are
/// accepted as well.
pub fn parse_http_date(s: &str) -> Result<Timestamp, ListingError> {
    let s = s.trim();
    if let Ok(date) = DateTime::parse_from_rfc2822(s) {
        return Ok(date.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDateTime::parse_from_str(s, "%A, %d-%b-%y %H:%M:%S GMT") {
        return Ok(date.and_utc());
    }
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Ok(date) = NaiveDateTime::parse_from_str(&collapsed, "%a %b %d %H:%M:%S %Y") {
        return Ok(date.and_utc());
    }
    Err(ListingError::InvalidDate(s.to_owned()))
}

/// One row of an FTP directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub name: String,
    pub size: u64,
    pub mtime: Timestamp,
    pub is_dir: bool,
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

fn month_number(name: &str) -> Option<u32> {
    MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(name))
        .map(|idx| idx as u32 + 1)
}

/// Splits off `n` whitespace separated columns and returns them with the remainder.
fn split_columns(line: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut columns = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    while columns.len() < n {
        let end = rest.find(char::is_whitespace)?;
        columns.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((columns, rest))
}

/// Parses one POSIX `ls -l` row.
///
/// Rows with a time of day instead of a year are placed in the year of `now`, or in the year
/// before if that would put them in the future. Listing times are interpreted as UTC. The
/// target of a symbolic link is stripped from the name.
pub fn parse_listing_line(line: &str, now: Timestamp) -> Result<ListingEntry, ListingError> {
    let malformed = || ListingError::MalformedListing(line.to_owned());

    let line = line.trim_end_matches(['\r', '\n']);
    let (columns, name) = split_columns(line, 8).ok_or_else(malformed)?;
    let name = name.trim_end();
    if name.is_empty() {
        return Err(malformed());
    }
    let name = match columns[0].starts_with('l') {
        true => name.split(" -> ").next().unwrap_or(name),
        false => name,
    };

    let size = columns[4].parse::<u64>().map_err(|_| malformed())?;
    let month = month_number(columns[5]).ok_or_else(malformed)?;
    let day = columns[6].parse::<u32>().map_err(|_| malformed())?;

    let mtime = match columns[7].split_once(':') {
        Some((hour, minute)) => {
            let hour = hour.parse::<u32>().map_err(|_| malformed())?;
            let minute = minute.parse::<u32>().map_err(|_| malformed())?;
            let in_year = |year: i32| {
                NaiveDate::from_ymd_opt(year, month, day)
                    .and_then(|date| date.and_hms_opt(hour, minute, 0))
                    .map(|time| time.and_utc())
            };
            match in_year(now.year()) {
                Some(time) if time <= now => time,
                _ => in_year(now.year() - 1).ok_or_else(malformed)?,
            }
        }
        None => {
            let year = columns[7].parse::<i32>().map_err(|_| malformed())?;
            NaiveDate::from_ymd_opt(year, month, day)
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .ok_or_else(malformed)?
                .and_utc()
        }
    };

    Ok(ListingEntry {
        name: name.to_owned(),
        size,
        mtime,
        is_dir: columns[0].starts_with('d'),
    })
}

/// Formats a regular file the way `ls -l` does.
///
/// Files modified within the year before `now` show a time of day, older ones show the year.
/// [`parse_listing_line`] reads the result back given the same `now`.
pub fn format_listing_line(name: &str, size: u64, mtime: Timestamp, now: Timestamp) -> String {
    let recent = mtime <= now && mtime > now - chrono::Months::new(12);
    let time_or_year = match recent {
        true => mtime.format("%H:%M").to_string(),
        false => mtime.year().to_string(),
    };
    format!(
        "-rw-r--r--    1 ftp      ftp      {size:>12} {} {:>2} {time_or_year:>5} {name}",
        MONTHS[mtime.month0() as usize],
        mtime.day(),
    )
}
