//! Random-choice resolution, the first grammar pass.
//!
//! `{a; b; c:2}` draws exactly one branch per call, weighted by the
//! optional `:weight` suffixes. Groups nest, and may appear anywhere in
//! the prompt. Parenthesis and bracket regions opened inside a branch
//! are carried through verbatim, so `{(a); [b]}` resolves to one of
//! `(a)` or `[b]` and leaves the weight syntax for the second pass.

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use thiserror::Error;

use super::scanner::scan_weight_literal;

/// Fatal grammar errors. Every other malformed construct degrades to a
/// logged warning instead.
#[derive(Debug, Error, PartialEq)]
pub enum PromptError {
    /// A closed choice group whose branch weights are all zero has no
    /// distribution to draw from.
    #[error("invalid prompt input: {0}")]
    InvalidInput(String),
}

/// One branch of an open `{...}` group under construction.
struct Branch {
    text: String,
    weight: f64,
}

impl Branch {
    fn new() -> Self {
        Self { text: String::new(), weight: 1.0 }
    }
}

/// Resolves every choice group in `text`, returning the normalized
/// prompt the weight pass compiles.
///
/// The scan is a single left-to-right pass. A stack of pending closers
/// decides whether `;`, `:` and `}` are grammar or literal text: they
/// are only special while the innermost pending closer is `}`, which is
/// what keeps `(a:1.2)` intact inside a branch. An unmatched `}` is
/// literal text; groups still open at the end of input are resolved
/// innermost first, as if the missing closers were appended.
pub fn resolve_choices<R: Rng + ?Sized>(text: &str, rng: &mut R) -> Result<String, PromptError> {
    let mut pending: Vec<char> = Vec::new();
    // groups[0] is the output pseudo-group; each `{` opens a real one.
    let mut groups: Vec<Vec<Branch>> = vec![vec![Branch::new()]];

    let mut i = 0usize;
    while i < text.len() {
        let Some(c) = text[i..].chars().next() else { break };
        let in_choice = pending.last() == Some(&'}');
        match c {
            '{' => {
                pending.push('}');
                groups.push(vec![Branch::new()]);
                i += 1;
            }
            ';' if in_choice => {
                if let Some(group) = groups.last_mut() {
                    group.push(Branch::new());
                }
                i += 1;
            }
            ':' if in_choice => {
                let (value, next) = scan_weight_literal(text, i + 1);
                if let Some(value) = value
                    && let Some(branch) = groups.last_mut().and_then(|g| g.last_mut())
                {
                    branch.weight = value;
                }
                i = next;
            }
            '}' if in_choice => {
                pending.pop();
                if groups.len() > 1
                    && let Some(group) = groups.pop()
                {
                    let chosen = draw_branch(group, rng)?;
                    if let Some(parent) = groups.last_mut().and_then(|g| g.last_mut()) {
                        parent.text.push_str(&chosen);
                    }
                }
                i += 1;
            }
            _ => {
                if let Some(branch) = groups.last_mut().and_then(|g| g.last_mut()) {
                    branch.text.push(c);
                }
                match c {
                    '(' => pending.push(')'),
                    '[' => pending.push(']'),
                    _ if pending.last() == Some(&c) => {
                        pending.pop();
                    }
                    _ => {}
                }
                i += c.len_utf8();
            }
        }
    }

    // Unterminated groups resolve as if closed at end of input.
    while groups.len() > 1 {
        let Some(group) = groups.pop() else { break };
        let chosen = draw_branch(group, rng)?;
        if let Some(parent) = groups.last_mut().and_then(|g| g.last_mut()) {
            parent.text.push_str(&chosen);
        }
    }

    Ok(groups
        .pop()
        .and_then(|mut g| g.pop())
        .map(|b| b.text)
        .unwrap_or_default())
}

/// Draws one branch from a closed group. Negative weights clamp to
/// zero before normalization.
fn draw_branch<R: Rng + ?Sized>(group: Vec<Branch>, rng: &mut R) -> Result<String, PromptError> {
    let dist = WeightedIndex::new(group.iter().map(|b| b.weight.max(0.0))).map_err(|_| {
        PromptError::InvalidInput("choice group has no branch with positive weight".to_string())
    })?;
    let index = dist.sample(rng);
    Ok(group
        .into_iter()
        .nth(index)
        .map(|b| b.text)
        .unwrap_or_default())
}
