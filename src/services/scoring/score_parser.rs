// Score Parser
// Extracts the `スコア` / `理由` pair from the judge's free-text reply.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

pub const SCORE_LABEL: &str = "スコア";
pub const REASON_LABEL: &str = "理由";
pub const MAX_SCORE: u8 = 9;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    #[error("no score line in response")]
    MissingScore,
    #[error("no reason line in response")]
    MissingReason,
    #[error("score is not an integer: {0:?}")]
    NonNumericScore(String),
    #[error("score {0} is outside 0-9")]
    ScoreOutOfRange(u64),
}

/// A labeled line: the label at the start (after indentation), then an ASCII
/// or full-width colon, then the value.
fn labeled_line(label: &str) -> Regex {
    Regex::new(&format!(r"^\s*{}\s*[:：](.*)$", regex::escape(label)))
        .expect("label pattern is built from an escaped literal")
}

fn score_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| labeled_line(SCORE_LABEL))
}

fn reason_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| labeled_line(REASON_LABEL))
}

/// First non-empty value carried by a line matching `re`.
fn first_value<'a>(re: &Regex, content: &'a str) -> Option<&'a str> {
    content
        .lines()
        .filter_map(|line| re.captures(line))
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .find(|v| !v.is_empty())
}

/// Parse a judge reply into `(score, reason)`.
///
/// Lines may come in either order and be mixed with other text; when a label
/// repeats only its first value-bearing line counts. Reason length is not
/// checked here.
pub fn parse_judgment(content: &str) -> Result<(u8, String), ParseFailure> {
    let raw_score = first_value(score_re(), content).ok_or(ParseFailure::MissingScore)?;
    let reason = first_value(reason_re(), content).ok_or(ParseFailure::MissingReason)?;

    // Models sometimes answer with full-width digits.
    let digits: String = raw_score
        .chars()
        .map(|c| match c {
            '０'..='９' => char::from(b'0' + (c as u32 - '０' as u32) as u8),
            other => other,
        })
        .collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ParseFailure::NonNumericScore(raw_score.to_string()));
    }
    let score: u64 = digits
        .parse()
        .map_err(|_| ParseFailure::NonNumericScore(raw_score.to_string()))?;
    if score > MAX_SCORE as u64 {
        return Err(ParseFailure::ScoreOutOfRange(score));
    }

    Ok((score as u8, reason.to_string()))
}
