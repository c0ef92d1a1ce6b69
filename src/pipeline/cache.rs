//! Cached pipeline state and re-entry selection.

use std::fmt;

use crate::backend::{Embedding, ModelSpec};
use crate::prompt::CompiledPrompt;
use crate::store::values::GenerationParams;

/// Where a job enters the stage walk, given what survives from the
/// previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    /// Model identity changed (or nothing is cached): full reload.
    LoadModel,
    /// Same model, different prompt text: re-embed only.
    UpdatePrompt,
    /// Same model and prompts: straight to numeric parameters.
    SetupParams,
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntryPoint::LoadModel => "load_model",
            EntryPoint::UpdatePrompt => "update_prompt",
            EntryPoint::SetupParams => "setup_params",
        })
    }
}

/// A compiled prompt together with its blended embedding.
#[derive(Debug, Clone)]
pub struct PromptSlot {
    pub compiled: CompiledPrompt,
    pub embedding: Embedding,
}

/// Model handle and prompt state carried between jobs.
///
/// The halves invalidate together: installing or dropping the model
/// always drops the prompt slots, since embeddings only mean anything
/// for the model that produced them.
#[derive(Debug)]
pub struct PipelineCache<M> {
    model: Option<(ModelSpec, M)>,
    prompts: Option<(PromptSlot, PromptSlot)>,
}

impl<M> Default for PipelineCache<M> {
    fn default() -> Self {
        Self { model: None, prompts: None }
    }
}

impl<M> PipelineCache<M> {
    /// Chooses where the next job enters the stage walk.
    ///
    /// Prompt comparison is raw request text against the cached
    /// normalized text, so any prompt with a random-choice group comes
    /// back through the prompt stage for a fresh draw.
    pub fn entry_point(&self, spec: &ModelSpec, params: &GenerationParams) -> EntryPoint {
        match &self.model {
            Some((cached, _)) if cached == spec => {}
            _ => return EntryPoint::LoadModel,
        }
        match &self.prompts {
            Some((positive, negative))
                if positive.compiled.normalized_text == params.prompt
                    && negative.compiled.normalized_text == params.negative_prompt =>
            {
                EntryPoint::SetupParams
            }
            _ => EntryPoint::UpdatePrompt,
        }
    }

    pub fn clear(&mut self) {
        self.model = None;
        self.prompts = None;
    }

    pub fn install_model(&mut self, spec: ModelSpec, model: M) {
        self.model = Some((spec, model));
        self.prompts = None;
    }

    pub fn model(&self) -> Option<&M> {
        self.model.as_ref().map(|(_, model)| model)
    }

    pub fn model_mut(&mut self) -> Option<&mut M> {
        self.model.as_mut().map(|(_, model)| model)
    }

    /// Takes the prompt slots out for refresh; they only come back via
    /// [`install_prompts`](Self::install_prompts), so a failed refresh
    /// leaves the cache empty rather than stale.
    pub fn take_prompts(&mut self) -> (Option<PromptSlot>, Option<PromptSlot>) {
        match self.prompts.take() {
            Some((positive, negative)) => (Some(positive), Some(negative)),
            None => (None, None),
        }
    }

    pub fn install_prompts(&mut self, positive: PromptSlot, negative: PromptSlot) {
        self.prompts = Some((positive, negative));
    }

    pub fn prompts(&self) -> Option<(&PromptSlot, &PromptSlot)> {
        self.prompts.as_ref().map(|(positive, negative)| (positive, negative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt;
    use std::path::PathBuf;

    fn spec(path: &str) -> ModelSpec {
        ModelSpec {
            path: PathBuf::from(path),
            revision: None,
            variant: None,
            clip_skip: None,
            lora_path: None,
            lora_alpha: None,
        }
    }

    fn params(prompt: &str, negative: &str) -> GenerationParams {
        GenerationParams {
            prompt: prompt.to_string(),
            negative_prompt: negative.to_string(),
            width: Some(64),
            height: Some(64),
            sampling_steps: 8,
            cfg_scale: 7.0,
            sampling_method: "Euler".to_string(),
            seed: None,
            size_range: None,
            highres_fix: Vec::new(),
        }
    }

    fn slot(text: &str) -> PromptSlot {
        PromptSlot {
            compiled: prompt::compile(text.to_string()),
            embedding: Embedding(vec![0.0]),
        }
    }

    fn full_cache() -> PipelineCache<&'static str> {
        let mut cache = PipelineCache::default();
        cache.install_model(spec("sd15"), "model");
        cache.install_prompts(slot("a cat"), slot(""));
        cache
    }

    #[test]
    fn empty_cache_loads_the_model() {
        let cache: PipelineCache<&str> = PipelineCache::default();
        assert_eq!(cache.entry_point(&spec("sd15"), &params("a cat", "")), EntryPoint::LoadModel);
    }

    #[test]
    fn model_without_prompts_updates_prompts() {
        let mut cache = PipelineCache::default();
        cache.install_model(spec("sd15"), "model");
        assert_eq!(
            cache.entry_point(&spec("sd15"), &params("a cat", "")),
            EntryPoint::UpdatePrompt
        );
    }

    #[test]
    fn unchanged_request_skips_to_setup() {
        let cache = full_cache();
        assert_eq!(
            cache.entry_point(&spec("sd15"), &params("a cat", "")),
            EntryPoint::SetupParams
        );
    }

    #[test]
    fn any_model_field_change_forces_a_reload() {
        let cache = full_cache();
        assert_eq!(
            cache.entry_point(&spec("sd21"), &params("a cat", "")),
            EntryPoint::LoadModel
        );

        let mut changed = spec("sd15");
        changed.lora_alpha = Some(0.5);
        assert_eq!(cache.entry_point(&changed, &params("a cat", "")), EntryPoint::LoadModel);
    }

    #[test]
    fn prompt_changes_reenter_at_update_prompt() {
        let cache = full_cache();
        assert_eq!(
            cache.entry_point(&spec("sd15"), &params("a dog", "")),
            EntryPoint::UpdatePrompt
        );
        assert_eq!(
            cache.entry_point(&spec("sd15"), &params("a cat", "blurry")),
            EntryPoint::UpdatePrompt
        );
    }

    #[test]
    fn choice_prompts_never_match_their_raw_text() {
        let mut cache = PipelineCache::default();
        cache.install_model(spec("sd15"), "model");
        // The cached slot holds a resolved draw, not the raw group.
        cache.install_prompts(slot("red cat"), slot(""));
        assert_eq!(
            cache.entry_point(&spec("sd15"), &params("{red;blue} cat", "")),
            EntryPoint::UpdatePrompt
        );
    }

    #[test]
    fn installing_a_model_drops_the_prompts() {
        let mut cache = full_cache();
        cache.install_model(spec("sd21"), "model");
        assert!(cache.prompts().is_none());
    }

    #[test]
    fn clear_resets_everything() {
        let mut cache = full_cache();
        cache.clear();
        assert!(cache.model().is_none());
        assert_eq!(cache.entry_point(&spec("sd15"), &params("a cat", "")), EntryPoint::LoadModel);
    }
}
