//! The prompt grammar compiler.
//!
//! Compilation is two passes over the raw prompt text:
//!
//! 1. [`resolve_choices`] draws one branch from every `{a; b}` group,
//!    yielding the normalized text that identifies the result.
//! 2. [`compile`] splits the normalized text along `(...)`/`[...]`
//!    weight brackets and decomposes the profile into
//!    [`WeightedSentence`] layers for the embedding blend.

mod choice;
mod scanner;
mod weights;

pub use choice::{PromptError, resolve_choices};
pub use weights::{CompiledPrompt, WeightedSentence, compile};
