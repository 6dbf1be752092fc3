//! Serde support for [`std::time::Duration`] fields expressed as `"60s"`,
//! `"500ms"`, `"5m"` or `"1h"` strings in configuration files.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let millis = duration.as_millis();
    if millis % 1000 == 0 {
        serializer.serialize_str(&format!("{}s", millis / 1000))
    } else {
        serializer.serialize_str(&format!("{millis}ms"))
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    use serde_json::Value;

    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => parse_duration_string(&s).map_err(Error::custom),
        Value::Number(n) => {
            // Bare numbers are interpreted as whole seconds.
            let secs = n
                .as_u64()
                .ok_or_else(|| Error::custom("duration must be a non-negative integer"))?;
            Ok(Duration::from_secs(secs))
        }
        _ => Err(Error::custom("invalid duration format")),
    }
}

fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (digits, unit): (String, String) = s.chars().partition(|c| c.is_ascii_digit());
    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration amount in '{s}'"))?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" | "" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        other => Err(format!("unknown duration unit '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "super")]
        d: Duration,
    }

    #[test]
    fn round_trips_seconds() {
        let w: Wrapper = serde_json::from_str(r#"{"d":"60s"}"#).unwrap();
        assert_eq!(w.d, Duration::from_secs(60));
        let out = serde_json::to_string(&w).unwrap();
        assert_eq!(out, r#"{"d":"60s"}"#);
    }

    #[test]
    fn parses_millis_minutes_and_bare_numbers() {
        let w: Wrapper = serde_json::from_str(r#"{"d":"250ms"}"#).unwrap();
        assert_eq!(w.d, Duration::from_millis(250));
        let w: Wrapper = serde_json::from_str(r#"{"d":"5m"}"#).unwrap();
        assert_eq!(w.d, Duration::from_secs(300));
        let w: Wrapper = serde_json::from_str(r#"{"d":30}"#).unwrap();
        assert_eq!(w.d, Duration::from_secs(30));
    }
}
