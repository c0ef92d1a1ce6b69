//! Bracket-weight decomposition, the second grammar pass.
//!
//! The normalized prompt is split into chunks at `(`, `[`, `)`, `]`
//! boundaries. Each `(...)` level multiplies the weight of the chunks
//! it encloses by 1.1 and each `[...]` level by 0.9; a `:value` suffix
//! replaces the innermost open level's multiplier outright. The chunk
//! profile is then peeled into layers: every layer is the full-length
//! sentence of the chunks still carrying weight, emitted at the current
//! minimum, and the backend blend of those layers reconstructs the
//! per-chunk profile even though the backend only embeds whole
//! sentences.

use super::scanner::scan_weight_literal;

/// Weight multiplier per enclosing `(...)` level.
const RAISE_FACTOR: f64 = 1.1;
/// Weight multiplier per enclosing `[...]` level.
const LOWER_FACTOR: f64 = 0.9;
/// Chunks never leave the scan below this weight.
const MIN_CHUNK_WEIGHT: f64 = 0.01;
/// Residual chunk weight below this is dropped between layers.
const LAYER_EPSILON: f64 = 0.001;

/// A text fragment with the weight accumulated from its enclosing
/// bracket levels.
#[derive(Debug, Clone, PartialEq)]
struct Chunk {
    text: String,
    weight: f64,
}

/// A full-length sentence paired with the additive weight of one
/// decomposition layer.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedSentence {
    pub text: String,
    pub weight: f64,
}

/// A grammar-compiled prompt ready for embedding.
///
/// `normalized_text` is the choice-resolved source text and doubles as
/// the cache key: compiling the same normalized text always yields the
/// same sentences.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPrompt {
    pub normalized_text: String,
    pub sentences: Vec<WeightedSentence>,
}

/// Compiles a choice-resolved prompt into weighted sentences.
pub fn compile(normalized_text: String) -> CompiledPrompt {
    let sentences = decompose(scan_chunks(&normalized_text));
    CompiledPrompt { normalized_text, sentences }
}

/// Splits `text` into chunks with bracket-level weights applied.
fn scan_chunks(text: &str) -> Vec<Chunk> {
    let mut chunks = vec![Chunk { text: String::new(), weight: 1.0 }];
    // One marker per open bracket: index of its first enclosed chunk
    // plus the multiplier applied when it closes.
    let mut open: Vec<(usize, f64)> = Vec::new();

    let mut i = 0usize;
    while i < text.len() {
        let Some(c) = text[i..].chars().next() else { break };
        match c {
            '(' => {
                open.push((chunks.len(), RAISE_FACTOR));
                chunks.push(Chunk { text: String::new(), weight: 1.0 });
                i += 1;
            }
            '[' => {
                open.push((chunks.len(), LOWER_FACTOR));
                chunks.push(Chunk { text: String::new(), weight: 1.0 });
                i += 1;
            }
            ')' | ']' => {
                if let Some((start, factor)) = open.pop() {
                    for chunk in &mut chunks[start..] {
                        chunk.weight *= factor;
                    }
                }
                chunks.push(Chunk { text: String::new(), weight: 1.0 });
                i += 1;
            }
            ':' => {
                let (value, next) = scan_weight_literal(text, i + 1);
                if let Some(value) = value
                    && let Some(marker) = open.last_mut()
                {
                    marker.1 = value;
                }
                i = next;
            }
            _ => {
                if let Some(chunk) = chunks.last_mut() {
                    chunk.text.push(c);
                }
                i += c.len_utf8();
            }
        }
    }

    chunks.retain(|c| !c.text.is_empty());
    for chunk in &mut chunks {
        chunk.weight = chunk.weight.max(MIN_CHUNK_WEIGHT);
    }
    chunks
}

/// Peels minimum-weight layers off the chunk profile until no chunk
/// retains weight.
fn decompose(mut remaining: Vec<Chunk>) -> Vec<WeightedSentence> {
    let mut sentences = Vec::new();
    while !remaining.is_empty() {
        let layer = remaining
            .iter()
            .map(|c| c.weight)
            .fold(f64::INFINITY, f64::min);
        let text = remaining
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        sentences.push(WeightedSentence { text, weight: layer });
        for chunk in &mut remaining {
            chunk.weight -= layer;
        }
        remaining.retain(|c| c.weight >= LAYER_EPSILON);
    }
    sentences
}
