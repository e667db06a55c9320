//! Kubernetes resource quantities.
//!
//! Memory is normalised to bytes and CPU to millicores, which is what the
//! metrics API reports and what limits are compared against.

use crate::error::{Result, WatchError};

const BINARY_SUFFIXES: [(&str, u64); 6] = [
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

const DECIMAL_SUFFIXES: [(&str, u64); 6] = [
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

/// Parses a memory quantity such as `512Mi`, `1G` or `1048576` into bytes.
///
/// # Errors
///
/// Returns `WatchError::ConfigurationInvalid` if the quantity is malformed.
pub fn parse_memory(input: &str) -> Result<u64> {
    let input = input.trim();
    for (suffix, factor) in BINARY_SUFFIXES.iter().chain(DECIMAL_SUFFIXES.iter()) {
        if let Some(number) = input.strip_suffix(suffix) {
            return scale(number, *factor as f64, 1.0, input);
        }
    }
    // Metrics servers sometimes report sub-byte precision ("1500m" bytes).
    if let Some(number) = input.strip_suffix('m') {
        return scale(number, 1.0, 1000.0, input);
    }
    scale(input, 1.0, 1.0, input)
}

/// Parses a CPU quantity such as `500m`, `2` or `0.25` into millicores.
///
/// Nanocore (`n`) and microcore (`u`) values from the metrics API are
/// rounded up to the next millicore.
///
/// # Errors
///
/// Returns `WatchError::ConfigurationInvalid` if the quantity is malformed.
pub fn parse_cpu(input: &str) -> Result<u64> {
    let input = input.trim();
    if let Some(number) = input.strip_suffix('n') {
        return scale(number, 1.0, 1_000_000.0, input);
    }
    if let Some(number) = input.strip_suffix('u') {
        return scale(number, 1.0, 1000.0, input);
    }
    if let Some(number) = input.strip_suffix('m') {
        return scale(number, 1.0, 1.0, input);
    }
    scale(input, 1000.0, 1.0, input)
}

fn scale(number: &str, factor: f64, divisor: f64, original: &str) -> Result<u64> {
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| WatchError::config(format!("invalid quantity '{original}'")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(WatchError::config(format!(
            "quantity '{original}' must be a non-negative number"
        )));
    }
    Ok((value * factor / divisor).ceil() as u64)
}

/// Formats bytes with the largest binary suffix that keeps one decimal of precision.
#[must_use]
pub fn format_memory(bytes: u64) -> String {
    for (suffix, factor) in BINARY_SUFFIXES.iter().rev() {
        if bytes >= *factor {
            let value = bytes as f64 / *factor as f64;
            return if bytes % factor == 0 {
                format!("{}{suffix}", bytes / factor)
            } else {
                format!("{value:.1}{suffix}")
            };
        }
    }
    format!("{bytes}B")
}

/// Formats millicores the way `kubectl top` does.
#[must_use]
pub fn format_cpu(millicores: u64) -> String {
    format!("{millicores}m")
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("512Mi", 512 * 1024 * 1024 ; "mebibytes")]
    #[test_case("1Gi", 1024 * 1024 * 1024 ; "gibibytes")]
    #[test_case("1G", 1_000_000_000 ; "decimal gigabytes")]
    #[test_case("128974848", 128_974_848 ; "plain bytes")]
    #[test_case("1.5Ki", 1536 ; "fractional")]
    #[test_case("100", 100 ; "small plain")]
    fn parses_memory(input: &str, expected: u64) {
        assert_eq!(parse_memory(input).unwrap(), expected);
    }

    #[test_case("500m", 500 ; "millicores")]
    #[test_case("2", 2000 ; "whole cores")]
    #[test_case("0.25", 250 ; "fractional cores")]
    #[test_case("250000000n", 250 ; "nanocores")]
    #[test_case("1500u", 2 ; "microcores round up")]
    fn parses_cpu(input: &str, expected: u64) {
        assert_eq!(parse_cpu(input).unwrap(), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("lots" ; "not a number")]
    #[test_case("-5Mi" ; "negative")]
    #[test_case("12Qi" ; "unknown suffix")]
    fn rejects_bad_memory(input: &str) {
        assert!(matches!(
            parse_memory(input),
            Err(WatchError::ConfigurationInvalid { .. })
        ));
    }

    #[test]
    fn rejects_bad_cpu() {
        assert!(parse_cpu("fast").is_err());
        assert!(parse_cpu("-1").is_err());
    }

    #[test]
    fn formats_memory() {
        assert_eq!(format_memory(100), "100B");
        assert_eq!(format_memory(100 * 1024 * 1024), "100Mi");
        assert_eq!(format_memory(1536 * 1024 * 1024), "1.5Gi");
    }

    #[test]
    fn formats_cpu() {
        assert_eq!(format_cpu(250), "250m");
    }
}
