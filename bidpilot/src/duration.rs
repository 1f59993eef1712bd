use std::time::Duration;

use crate::errors::WizardError;

/// Parse human-readable duration strings
/// Supports formats like: "1s", "500ms", "2m", "1.5s", "30", "2h"
pub fn parse_duration(input: &str) -> Result<Duration, WizardError> {
    let input = input.trim();

    // Plain numbers are milliseconds
    if let Ok(ms) = input.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }

    let (number_part, unit_part) = split_number_and_unit(input)?;
    let value: f64 = number_part.parse().map_err(|_| {
        WizardError::InvalidArgument(format!("Invalid number in duration: {number_part}"))
    })?;
    if value < 0.0 || !value.is_finite() {
        return Err(WizardError::InvalidArgument(format!(
            "Duration must be a positive number: {input}"
        )));
    }

    let multiplier = match unit_part {
        "ms" | "milliseconds" | "millisecond" => 1.0,
        "s" | "sec" | "secs" | "second" | "seconds" => 1000.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600_000.0,
        "" => 1.0,
        _ => {
            return Err(WizardError::InvalidArgument(format!(
                "Unknown time unit: {unit_part}"
            )))
        }
    };

    Ok(Duration::from_millis((value * multiplier) as u64))
}

fn split_number_and_unit(input: &str) -> Result<(&str, &str), WizardError> {
    let split_pos = input
        .char_indices()
        .find(|(_, ch)| ch.is_alphabetic())
        .map(|(i, _)| i)
        .unwrap_or(input.len());

    let number_part = input[..split_pos].trim();
    let unit_part = input[split_pos..].trim();

    if number_part.is_empty() {
        return Err(WizardError::InvalidArgument(format!(
            "No numeric value in duration: {input}"
        )));
    }

    Ok((number_part, unit_part))
}

/// Render a duration back into the shortest form `parse_duration` accepts
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        "0ms".to_string()
    } else if ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

/// `#[serde(with = "crate::duration::serde_human")]` for config fields
pub mod serde_human {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(u64),
            Text(String),
        }
        match Raw::deserialize(d)? {
            Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
            Raw::Text(s) => super::parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_milliseconds() {
        assert_eq!(parse_duration("500").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("20 minutes").unwrap(), Duration::from_secs(1200));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_errors() {
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("5 fortnights").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
    }
}
