use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// Environment variable consulted for reproducible builds,
/// see <https://reproducible-builds.org/specs/source-date-epoch/>.
pub const SOURCE_DATE_EPOCH: &str = "SOURCE_DATE_EPOCH";

/// Try to parse an RFC 3339, warn on error.
pub fn try_deserialize_timestamp(t: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(t).context("Parsing timestamp") {
        Ok(t) => Some(t.into()),
        Err(e) => {
            tracing::warn!("Invalid timestamp: {:#}", e);
            None
        }
    }
}

/// Render a timestamp the way it is embedded into images and compared
/// against the `BuildTimestamp` reported by a running instance.
pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Determine the timestamp of the current build: `SOURCE_DATE_EPOCH` if
/// set, otherwise the current time truncated to whole seconds.
pub fn build_timestamp() -> Result<DateTime<Utc>> {
    match std::env::var(SOURCE_DATE_EPOCH) {
        Ok(v) => {
            let secs: i64 = v
                .trim()
                .parse()
                .with_context(|| format!("Parsing {SOURCE_DATE_EPOCH}={v}"))?;
            Utc.timestamp_opt(secs, 0)
                .single()
                .with_context(|| format!("{SOURCE_DATE_EPOCH} out of range: {secs}"))
        }
        Err(_) => {
            let now = Utc::now();
            Ok(Utc
                .timestamp_opt(now.timestamp(), 0)
                .single()
                .unwrap_or(now))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_roundtrip() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        let s = format_timestamp(&t);
        assert_eq!(s, "2024-03-01T12:30:05Z");
        assert_eq!(try_deserialize_timestamp(&s), Some(t));
        assert_eq!(try_deserialize_timestamp("yesterday"), None);
    }
}
