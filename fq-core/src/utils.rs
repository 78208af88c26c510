//! # Common Utilities
//!
//! Small helpers shared across the workspace.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::types::TxTime;

/// Current wall clock in whole seconds, as the window stamp type.
pub fn now_unix_secs() -> TxTime {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as TxTime
}

/// Current wall clock in milliseconds; WAL segment names embed this.
pub fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// Current wall clock in nanoseconds; temp dump file names embed this.
pub fn now_unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos()
}

/// Parse a human size like `4KB`, `10MB`, `1GB` or a bare byte count.
/// Units are binary (1KB = 1024).
pub fn parse_size(input: &str) -> Result<usize> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::Configuration {
            message: "empty size".to_string(),
        });
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);

    let number: usize = digits.parse().map_err(|_| Error::Configuration {
        message: format!("invalid size: {input:?}"),
    })?;

    let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" | "K" => 1 << 10,
        "MB" | "M" => 1 << 20,
        "GB" | "G" => 1 << 30,
        _ => {
            return Err(Error::Configuration {
                message: format!("unknown size unit in {input:?}"),
            })
        }
    };

    Ok(number * multiplier)
}

/// Parse a duration like `10ms`, `1s`, `5m`, `1h`.
pub fn parse_duration(input: &str) -> Result<std::time::Duration> {
    let s = input.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| Error::Configuration {
            message: format!("duration {input:?} is missing a unit"),
        })?;
    let (digits, unit) = s.split_at(split);

    let number: u64 = digits.parse().map_err(|_| Error::Configuration {
        message: format!("invalid duration: {input:?}"),
    })?;

    let duration = match unit.trim() {
        "us" => std::time::Duration::from_micros(number),
        "ms" => std::time::Duration::from_millis(number),
        "s" => std::time::Duration::from_secs(number),
        "m" => std::time::Duration::from_secs(number * 60),
        "h" => std::time::Duration::from_secs(number * 3600),
        _ => {
            return Err(Error::Configuration {
                message: format!("unknown duration unit in {input:?}"),
            })
        }
    };

    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parse_size_units() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("4KB").unwrap(), 4096);
        assert_eq!(parse_size("10MB").unwrap(), 10 << 20);
        assert_eq!(parse_size("1GB").unwrap(), 1 << 30);
        assert!(parse_size("10XB").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("10ms").unwrap(), Duration::from_millis(10));
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10weeks").is_err());
    }
}
