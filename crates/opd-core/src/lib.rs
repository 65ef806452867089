pub mod defaults;
pub mod settings;
pub mod types;

pub use types::*;

use std::time::Duration;

/// Current UTC time as RFC 3339, empty on formatting failure.
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Human elapsed time: `42s`, `1m 05s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (m, s) = (secs / 60, secs % 60);
    if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

/// Truncate to at most `max` chars, respecting char boundaries.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_under_a_minute() {
        assert_eq!(format_elapsed(Duration::from_millis(42_900)), "42s");
    }

    #[test]
    fn elapsed_with_minutes_pads_seconds() {
        assert_eq!(format_elapsed(Duration::from_secs(65)), "1m 05s");
        assert_eq!(format_elapsed(Duration::from_secs(600)), "10m 00s");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn rfc3339_has_date_prefix() {
        let ts = now_rfc3339();
        assert!(ts.len() >= 20, "unexpected timestamp: {ts}");
        assert_eq!(&ts[4..5], "-");
    }
}
