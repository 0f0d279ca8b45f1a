//! Datetime formatting shared by filename parsing and path construction.
//!
//! Spec §6: all in-filename timestamps use `YYYY-MM-DD_HH-MM-SS`, UTC.

use jiff::Timestamp;

pub const DATETIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Formats an instant as `YYYY-MM-DD_HH-MM-SS` in UTC, for embedding in
/// filenames.
pub fn format_datetime(instant: Timestamp) -> String {
    instant.strftime(DATETIME_FORMAT).to_string()
}

/// Parses a `YYYY-MM-DD_HH-MM-SS` substring (UTC) back into an instant.
pub fn parse_datetime(s: &str) -> Option<Timestamp> {
    let dt = jiff::civil::DateTime::strptime(DATETIME_FORMAT, s).ok()?;
    dt.to_zoned(jiff::tz::TimeZone::UTC)
        .ok()
        .map(|z| z.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let t: Timestamp = "2024-03-05T12:34:56Z".parse().unwrap();
        let s = format_datetime(t);
        assert_eq!(s, "2024-03-05_12-34-56");
        assert_eq!(parse_datetime(&s).unwrap(), t);
    }

    #[test]
    fn rejects_malformed() {
        assert!(parse_datetime("not-a-date").is_none());
    }
}
