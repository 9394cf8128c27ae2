//! Guesses which tracker issue a patch refers to from its free-form description.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref TOKEN: Regex = Regex::new(r"[\w)]+").unwrap();
    static ref PAREN_NUM: Regex = Regex::new(r"\((\d+)\)").unwrap();
}

const KEYWORDS: &[&str] = &["fix", "issue"];

fn positive(s: &str) -> Option<u64> {
    s.parse().ok().filter(|&n| n > 0)
}

/// Finds an issue number in `text`.
///
/// A number following the word "fix" or "issue" (any case) wins, the leftmost one first. Failing
/// that, the first parenthesized number is taken. Never returns 0.
///
/// ```text
/// "Fix 123"          -> 123
/// "(Issue 123)"      -> 123
/// "Beams (123)"      -> 123
/// "no reference"     -> None
/// ```
pub fn find_issue_id(text: &str) -> Option<u64> {
    let tokens: Vec<&str> = TOKEN.find_iter(text).map(|m| m.as_str()).collect();
    for pair in tokens.windows(2) {
        if KEYWORDS.iter().any(|k| pair[0].eq_ignore_ascii_case(k)) {
            let next = pair[1].strip_suffix(')').unwrap_or(pair[1]);
            if let Some(n) = positive(next) {
                return Some(n);
            }
        }
    }
    PAREN_NUM
        .captures_iter(text)
        .find_map(|cap| positive(&cap[1]))
}
