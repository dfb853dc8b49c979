use std::sync::LazyLock;

use crate::error::HistoryError;

// Matches one range token, e.g. "7", "1-5", "2:6" or "~5/8-~2/3".
static RANGE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"^((?P<startsess>~?\d+)/)?(?P<start>\d+)((?P<sep>[-:])((?P<endsess>~?\d+)/)?(?P<end>\d+))?",
    )
    .unwrap()
});

/// One span of lines within a single session.
///
/// `session` follows the query convention: 0 is the current session,
/// positive numbers are absolute session ids, and negative numbers count
/// back from the current session. `stop` is exclusive; `None` means to
/// the end of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSelector {
    pub session: i64,
    pub start: i64,
    pub stop: Option<i64>,
}

/// Parse a whitespace-separated string of range tokens into selectors.
///
/// Each token has the form `[sessionA/]start[(-|:)[sessionB/]end]`, where
/// `-` includes the end line and `:` excludes it, and a leading `~` on a
/// session counts back from the current one. A bare `start` selects that
/// single line. Tokens that do not match the grammar are skipped.
///
/// A range spanning several sessions expands to one selector per session:
/// the rest of the first, all of each intermediate, and the head of the
/// last. The end session must not precede the start session.
pub fn extract_ranges(ranges_str: &str) -> Result<Vec<RangeSelector>, HistoryError> {
    let mut selectors = Vec::new();
    for token in ranges_str.split_whitespace() {
        let Some(caps) = RANGE_RE.captures(token) else {
            continue;
        };
        let Ok(start) = caps["start"].parse::<i64>() else {
            continue;
        };
        let mut end = match caps.name("end") {
            Some(end) => match end.as_str().parse::<i64>() {
                Ok(end) => end,
                Err(_) => continue,
            },
            // No end specified: select the single line (a, a + 1)
            None => start + 1,
        };
        if caps.name("sep").map(|m| m.as_str()) == Some("-") {
            end += 1; // 1-3 == 1:4
        }
        let startsess_tok = caps.name("startsess").map_or("0", |m| m.as_str());
        let endsess_tok = caps.name("endsess").map_or(startsess_tok, |m| m.as_str());
        let (Some(startsess), Some(endsess)) =
            (parse_session(startsess_tok), parse_session(endsess_tok))
        else {
            continue;
        };
        if endsess < startsess {
            return Err(HistoryError::InvalidRange {
                token: token.to_string(),
            });
        }

        if endsess == startsess {
            selectors.push(RangeSelector {
                session: startsess,
                start,
                stop: Some(end),
            });
            continue;
        }
        // Multiple sessions in one range
        selectors.push(RangeSelector {
            session: startsess,
            start,
            stop: None,
        });
        for sess in startsess + 1..endsess {
            selectors.push(RangeSelector {
                session: sess,
                start: 1,
                stop: None,
            });
        }
        selectors.push(RangeSelector {
            session: endsess,
            start: 1,
            stop: Some(end),
        });
    }
    Ok(selectors)
}

fn parse_session(token: &str) -> Option<i64> {
    token.replace('~', "-").parse().ok()
}

/// Format a (session, line) coordinate for display. Lines in the current
/// session are shown bare; lines from other sessions as "session/line",
/// which round-trips through the range syntax.
pub fn format_line_label(session: i64, line: i64, current_session: i64) -> String {
    if session == 0 || session == current_session {
        line.to_string()
    } else {
        format!("{session}/{line}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sel(session: i64, start: i64, stop: Option<i64>) -> RangeSelector {
        RangeSelector {
            session,
            start,
            stop,
        }
    }

    #[test]
    fn test_single_line() {
        let ranges = extract_ranges("5").unwrap();
        assert_eq!(ranges, vec![sel(0, 5, Some(6))]);
    }

    #[test]
    fn test_inclusive_range() {
        let ranges = extract_ranges("1-3").unwrap();
        assert_eq!(ranges, vec![sel(0, 1, Some(4))]);
    }

    #[test]
    fn test_half_open_range() {
        let ranges = extract_ranges("2:4").unwrap();
        assert_eq!(ranges, vec![sel(0, 2, Some(4))]);
    }

    #[test]
    fn test_session_qualified() {
        let ranges = extract_ranges("~2/3-5").unwrap();
        assert_eq!(ranges, vec![sel(-2, 3, Some(6))]);
    }

    #[test]
    fn test_end_session_defaults_to_start_session() {
        let ranges = extract_ranges("4/2:9").unwrap();
        assert_eq!(ranges, vec![sel(4, 2, Some(9))]);
    }

    #[test]
    fn test_multi_session_expansion() {
        let ranges = extract_ranges("~8/5-~6/4").unwrap();
        assert_eq!(
            ranges,
            vec![sel(-8, 5, None), sel(-7, 1, None), sel(-6, 1, Some(5))]
        );
    }

    #[test]
    fn test_multiple_tokens() {
        let ranges = extract_ranges("3 7-9").unwrap();
        assert_eq!(ranges, vec![sel(0, 3, Some(4)), sel(0, 7, Some(10))]);
    }

    #[test]
    fn test_unmatched_tokens_skipped() {
        let ranges = extract_ranges("foo 5 x2").unwrap();
        assert_eq!(ranges, vec![sel(0, 5, Some(6))]);
    }

    #[test]
    fn test_trailing_garbage_ignored() {
        // Matching is anchored at the token start only
        let ranges = extract_ranges("5abc").unwrap();
        assert_eq!(ranges, vec![sel(0, 5, Some(6))]);
    }

    #[test]
    fn test_empty_string() {
        assert_eq!(extract_ranges("").unwrap(), vec![]);
    }

    #[test]
    fn test_backwards_sessions_rejected() {
        let err = extract_ranges("~2/1-~5/3").unwrap_err();
        assert!(
            matches!(err, HistoryError::InvalidRange { ref token } if token == "~2/1-~5/3"),
            "expected InvalidRange, got: {err:?}"
        );
    }

    #[test]
    fn test_rejection_drops_earlier_tokens() {
        // The whole call fails, even when earlier tokens were valid
        assert!(extract_ranges("1 ~2/1-~5/3").is_err());
    }

    #[test]
    fn test_format_line_label() {
        assert_eq!(format_line_label(0, 7, 3), "7");
        assert_eq!(format_line_label(3, 7, 3), "7");
        assert_eq!(format_line_label(2, 7, 3), "2/7");
    }
}
