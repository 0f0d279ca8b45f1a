//! Parsing of the project's required filename format (spec §6):
//! `<hostname>_<rest>_YYYY-MM-DD_HH-MM-SS.<ext>`.

use base::{err, Error};
use jiff::Timestamp;
use std::path::Path;

#[derive(Clone, Debug, PartialEq)]
pub struct ParsedFilename {
    pub hostname: String,
    pub start: Timestamp,
}

/// Extracts the hostname and start timestamp from a file's name.
///
/// The hostname is the prefix up to the first underscore *not* followed by
/// a digit (so `cam_01_2024-03-05_12-00-00.mp4` yields hostname `cam_01`,
/// not `cam`). The timestamp is the trailing `YYYY-MM-DD_HH-MM-SS` before
/// the extension.
pub fn parse(path: &Path) -> Result<ParsedFilename, Error> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| err!(FilenameMalformed, msg("path has no valid file stem: {:?}", path)))?;

    let hostname = extract_hostname(stem).ok_or_else(|| {
        err!(
            FilenameMalformed,
            msg("no hostname boundary (underscore not followed by a digit) in {:?}", stem)
        )
    })?;

    let ts_str = extract_trailing_timestamp(stem).ok_or_else(|| {
        err!(
            FilenameMalformed,
            msg("no trailing YYYY-MM-DD_HH-MM-SS timestamp in {:?}", stem)
        )
    })?;

    let start = base::time::parse_datetime(&ts_str).ok_or_else(|| {
        err!(FilenameMalformed, msg("unparseable timestamp {:?} in {:?}", ts_str, stem))
    })?;

    Ok(ParsedFilename {
        hostname: hostname.to_string(),
        start,
    })
}

fn extract_hostname(stem: &str) -> Option<&str> {
    let bytes = stem.as_bytes();
    let mut search_from = 0;
    loop {
        let rel = bytes[search_from..].iter().position(|&b| b == b'_')?;
        let idx = search_from + rel;
        let next = bytes.get(idx + 1);
        match next {
            Some(b) if b.is_ascii_digit() => {
                search_from = idx + 1;
                continue;
            }
            Some(_) => return Some(&stem[..idx]),
            None => return None,
        }
    }
}

/// The timestamp format is always exactly 19 characters:
/// `YYYY-MM-DD_HH-MM-SS`, preceded by an underscore.
fn extract_trailing_timestamp(stem: &str) -> Option<String> {
    const TS_LEN: usize = 19;
    if stem.len() < TS_LEN + 1 {
        return None;
    }
    let candidate = &stem[stem.len() - TS_LEN..];
    if stem.as_bytes()[stem.len() - TS_LEN - 1] != b'_' {
        return None;
    }
    if looks_like_timestamp(candidate) {
        Some(candidate.to_string())
    } else {
        None
    }
}

fn looks_like_timestamp(s: &str) -> bool {
    let b = s.as_bytes();
    let digit = |i: usize| b.get(i).is_some_and(u8::is_ascii_digit);
    b.len() == 19
        && (0..4).all(digit)
        && b[4] == b'-'
        && (5..7).all(digit)
        && b[7] == b'-'
        && (8..10).all(digit)
        && b[10] == b'_'
        && (11..13).all(digit)
        && b[13] == b'-'
        && (14..16).all(digit)
        && b[16] == b'-'
        && (17..19).all(digit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_hostname() {
        let p = parse(Path::new("cam1_rest_2024-03-05_12-34-56.mp4")).unwrap();
        assert_eq!(p.hostname, "cam1");
        assert_eq!(p.start, "2024-03-05T12:34:56Z".parse::<Timestamp>().unwrap());
    }

    #[test]
    fn hostname_boundary_skips_underscore_digit() {
        let p = parse(Path::new("host_01_rest_2024-03-05_12-34-56.mp4")).unwrap();
        assert_eq!(p.hostname, "host_01");
    }

    #[test]
    fn rejects_missing_timestamp() {
        assert!(parse(Path::new("badname.mp4")).is_err());
    }

    #[test]
    fn rejects_malformed_timestamp() {
        assert!(parse(Path::new("cam1_rest_2024-99-99_99-99-99.mp4")).is_err());
    }
}
