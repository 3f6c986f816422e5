//! Human-readable size parsing (e.g., "10TiB", "500MB").

use std::fmt;
use thiserror::Error;

/// Error parsing a size string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid size '{input}' - expected format like '10TiB', '2GB', or '500MB'")]
pub struct SizeParseError {
    input: String,
}

impl SizeParseError {
    fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

const UNITS: [(&str, u32); 5] = [("K", 1), ("M", 2), ("G", 3), ("T", 4), ("P", 5)];

/// Parse a human-readable size string into bytes.
///
/// Supports:
/// - Bare numbers (treated as bytes)
/// - K/KB/KiB through P/PB/PiB suffixes, all 1024-based
/// - Case-insensitive
/// - Whitespace tolerant
///
/// # Examples
///
/// ```
/// use modelvol::config::parse_size;
///
/// assert_eq!(parse_size("1024").unwrap(), 1024);
/// assert_eq!(parse_size("1KB").unwrap(), 1024);
/// assert_eq!(parse_size("2GiB").unwrap(), 2 * 1024 * 1024 * 1024);
/// assert_eq!(parse_size("10TiB").unwrap(), 10 * 1024u64.pow(4));
/// ```
pub fn parse_size(s: &str) -> Result<u64, SizeParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(SizeParseError::new(s));
    }

    let upper = s.to_uppercase();

    let (num_str, multiplier) = UNITS
        .iter()
        .find_map(|(prefix, exp)| {
            let suffix_len = [format!("{prefix}IB"), format!("{prefix}B"), prefix.to_string()]
                .into_iter()
                .find(|suffix| upper.ends_with(suffix))
                .map(|suffix| suffix.len())?;
            Some((s[..s.len() - suffix_len].trim(), 1024u64.pow(*exp)))
        })
        .unwrap_or_else(|| {
            if upper.ends_with('B') {
                (s[..s.len() - 1].trim(), 1)
            } else {
                (s, 1)
            }
        });

    let num: u64 = num_str.parse().map_err(|_| SizeParseError::new(s))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| SizeParseError::new(s))
}

/// Format a byte count the way IEC binary sizes are usually printed
/// ("1.0 MiB", "512 MiB", "8.0 TiB").
///
/// Values below 10 in their unit keep one decimal; larger values are
/// printed as integers.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut exp = 0usize;
    let mut div = 1u64;
    while exp < UNITS.len() - 1 && bytes >= div.saturating_mul(1024) {
        div = div.saturating_mul(1024);
        exp += 1;
    }

    let val = ((bytes as f64 / div as f64) * 10.0 + 0.5).floor() / 10.0;
    if val < 10.0 {
        format!("{val:.1} {}", UNITS[exp])
    } else {
        format!("{val:.0} {}", UNITS[exp])
    }
}

/// A byte count that parses from and formats to human-readable strings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size(pub u64);

impl Size {
    pub fn bytes(self) -> u64 {
        self.0
    }

    pub fn from_gib(gib: u64) -> Self {
        Self(gib * 1024 * 1024 * 1024)
    }

    pub fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_bytes(self.0))
    }
}

impl std::str::FromStr for Size {
    type Err = SizeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_size(s).map(Size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_number() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("999999").unwrap(), 999999);
    }

    #[test]
    fn test_parse_kib() {
        assert_eq!(parse_size("1KB").unwrap(), 1024);
        assert_eq!(parse_size("1kib").unwrap(), 1024);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("100KB").unwrap(), 100 * 1024);
    }

    #[test]
    fn test_parse_mib_gib() {
        assert_eq!(parse_size("1MB").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("500MiB").unwrap(), 500 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("2GB").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_tib_pib() {
        assert_eq!(parse_size("10TiB").unwrap(), 10 * 1024u64.pow(4));
        assert_eq!(parse_size("1PiB").unwrap(), 1024u64.pow(5));
    }

    #[test]
    fn test_parse_whitespace() {
        assert_eq!(parse_size("  2GB  ").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("2 GB").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
        assert!(parse_size("-1GB").is_err());
        assert!(parse_size("1.5GB").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(1024 * 1024), "1.0 MiB");
        assert_eq!(format_bytes(2 * 1024 * 1024), "2.0 MiB");
        assert_eq!(format_bytes(512 * 1024 * 1024), "512 MiB");
        assert_eq!(format_bytes(8 * 1024u64.pow(4)), "8.0 TiB");
        assert_eq!(format_bytes(100), "100 B");
    }

    #[test]
    fn test_size_from_helpers() {
        assert_eq!(Size::from_gib(2).bytes(), 2 * 1024 * 1024 * 1024);
        assert_eq!(Size::from_mib(500).bytes(), 500 * 1024 * 1024);
    }

    #[test]
    fn test_size_parse_display() {
        let size: Size = "10TiB".parse().unwrap();
        assert_eq!(size.bytes(), 10 * 1024u64.pow(4));
        assert_eq!(size.to_string(), "10 TiB");
    }
}
