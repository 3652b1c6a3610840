//! Saturating score arithmetic.
//!
//! Scores are signed integers clamped to `[-SCORE_INFINITY, SCORE_INFINITY]`.
//! The two extremes are sentinels: `+INFINITY` means "mandatory" and
//! `-INFINITY` means "forbidden". A sentinel absorbs any finite addend,
//! and combining the two sentinels is a configuration error.

use thiserror::Error;
use tracing::warn;

use crate::config::ClusterOptions;

/// Signed placement score.
pub type Score = i32;

/// Magnitude of the "infinite" sentinels.
pub const SCORE_INFINITY: Score = 1_000_000;

/// Mandatory sentinel.
pub const INFINITY: Score = SCORE_INFINITY;

/// Forbidden sentinel.
pub const MINUS_INFINITY: Score = -SCORE_INFINITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScoreError {
    #[error("cannot combine +INFINITY with -INFINITY")]
    InfiniteConflict,
}

/// Add two scores.
///
/// `+INFINITY` dominates any finite value, as does `-INFINITY`. Finite sums
/// saturate at the sentinels. Mixing the two sentinels is rejected.
pub fn add_scores(a: Score, b: Score) -> Result<Score, ScoreError> {
    let pos = a >= INFINITY || b >= INFINITY;
    let neg = a <= MINUS_INFINITY || b <= MINUS_INFINITY;
    match (pos, neg) {
        (true, true) => Err(ScoreError::InfiniteConflict),
        (true, false) => Ok(INFINITY),
        (false, true) => Ok(MINUS_INFINITY),
        (false, false) => Ok(clamp(i64::from(a) + i64::from(b))),
    }
}

/// Clamp a wide integer into the score range.
pub fn clamp(value: i64) -> Score {
    value.clamp(i64::from(MINUS_INFINITY), i64::from(INFINITY)) as Score
}

pub fn is_infinite(score: Score) -> bool {
    score >= INFINITY || score <= MINUS_INFINITY
}

/// Multiply a score by a factor, rounding half away from zero.
///
/// A nonzero score scaled by a nonzero factor never collapses to zero; it
/// becomes `1` or `-1` instead so that weak preferences still break ties.
pub fn scale_score(score: Score, factor: f32) -> Score {
    if factor == 1.0 || score == 0 {
        return score;
    }
    if factor == 0.0 {
        return 0;
    }
    let product = f64::from(score) * f64::from(factor);
    let rounded = if product < 0.0 {
        (product - 0.5).ceil()
    } else {
        (product + 0.5).floor()
    };
    let scaled = clamp(rounded as i64);
    if scaled == 0 {
        if product < 0.0 { -1 } else { 1 }
    } else {
        scaled
    }
}

/// Parse a configured score.
///
/// Accepts `INFINITY`, `+INFINITY`, `-INFINITY`, the node-health colors
/// `red`/`yellow`/`green` (mapped through `options`) and decimal integers.
/// Integers outside the score range saturate. Anything else parses as 0.
pub fn parse_score(text: &str, options: &ClusterOptions) -> Score {
    let trimmed = text.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "infinity" | "+infinity" => return INFINITY,
        "-infinity" => return MINUS_INFINITY,
        "red" => return options.node_health_red,
        "yellow" => return options.node_health_yellow,
        "green" => return options.node_health_green,
        _ => {}
    }
    match trimmed.parse::<i64>() {
        Ok(value) => clamp(value),
        Err(_) if is_integer_literal(trimmed) => {
            if trimmed.starts_with('-') { MINUS_INFINITY } else { INFINITY }
        }
        Err(_) => {
            warn!(score = trimmed, "using 0 in place of invalid score");
            0
        }
    }
}

fn is_integer_literal(text: &str) -> bool {
    let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Render a score the way it is configured.
pub fn readable_score(score: Score) -> String {
    if score >= INFINITY {
        "INFINITY".to_string()
    } else if score <= MINUS_INFINITY {
        "-INFINITY".to_string()
    } else {
        score.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infinity_absorbs_finite() {
        assert_eq!(add_scores(INFINITY, 5), Ok(INFINITY));
        assert_eq!(add_scores(-7, INFINITY), Ok(INFINITY));
        assert_eq!(add_scores(MINUS_INFINITY, 999_999), Ok(MINUS_INFINITY));
        assert_eq!(add_scores(3, MINUS_INFINITY), Ok(MINUS_INFINITY));
    }

    #[test]
    fn mixed_infinities_rejected() {
        assert_eq!(add_scores(INFINITY, MINUS_INFINITY), Err(ScoreError::InfiniteConflict));
        assert_eq!(add_scores(MINUS_INFINITY, INFINITY), Err(ScoreError::InfiniteConflict));
    }

    #[test]
    fn finite_sums_saturate() {
        assert_eq!(add_scores(600_000, 600_000), Ok(INFINITY));
        assert_eq!(add_scores(-600_000, -600_000), Ok(MINUS_INFINITY));
        assert_eq!(add_scores(100, -40), Ok(60));
    }

    #[test]
    fn parses_keywords_and_colors() {
        let opts = ClusterOptions::default();
        assert_eq!(parse_score("INFINITY", &opts), INFINITY);
        assert_eq!(parse_score("+INFINITY", &opts), INFINITY);
        assert_eq!(parse_score("-infinity", &opts), MINUS_INFINITY);
        assert_eq!(parse_score("red", &opts), MINUS_INFINITY);
        assert_eq!(parse_score("green", &opts), 0);
        assert_eq!(parse_score(" 250 ", &opts), 250);
    }

    #[test]
    fn parse_saturates_out_of_range_integers() {
        let opts = ClusterOptions::default();
        assert_eq!(parse_score("5000000", &opts), INFINITY);
        assert_eq!(parse_score("-99999999999999999999999", &opts), MINUS_INFINITY);
        assert_eq!(parse_score("banana", &opts), 0);
    }

    #[test]
    fn scaling_never_rounds_to_zero() {
        assert_eq!(scale_score(100, 0.5), 50);
        assert_eq!(scale_score(1, 0.1), 1);
        assert_eq!(scale_score(-1, 0.1), -1);
        assert_eq!(scale_score(3, -0.5), -2);
        assert_eq!(scale_score(INFINITY, 1.0), INFINITY);
        assert_eq!(scale_score(42, 0.0), 0);
    }

    #[test]
    fn readable_uses_keywords() {
        assert_eq!(readable_score(INFINITY), "INFINITY");
        assert_eq!(readable_score(MINUS_INFINITY), "-INFINITY");
        assert_eq!(readable_score(-12), "-12");
    }
}
