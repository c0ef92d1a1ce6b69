//! Weight-literal scanning shared by both grammar passes.

use tracing::warn;

/// Scans the numeric literal following a `:` in the grammar.
///
/// `start` is the byte offset just past the colon. The scan consumes
/// the maximal run of `.` and ASCII digit characters and returns the
/// parsed value together with the byte offset at which the caller
/// resumes. A run that is empty or does not parse as a number is
/// logged and reported as `None`; the prompt itself stays usable.
pub(crate) fn scan_weight_literal(text: &str, start: usize) -> (Option<f64>, usize) {
    let rest = &text[start..];
    let len = rest
        .find(|c: char| !(c == '.' || c.is_ascii_digit()))
        .unwrap_or(rest.len());
    let literal = &rest[..len];
    match literal.parse::<f64>() {
        Ok(value) => (Some(value), start + len),
        Err(_) => {
            warn!("ignoring malformed weight literal {literal:?}");
            (None, start + len)
        }
    }
}
