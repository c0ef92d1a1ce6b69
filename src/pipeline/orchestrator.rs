//! The generation stage walk.
//!
//! Stages run strictly forward: load model, update prompts, set up
//! parameters, select the sampler, generate, then zero or more highres
//! passes. The entry point is chosen by comparing the request against
//! the cache from the previous job, so an unchanged model skips its
//! reload and unchanged prompts skip their embedding.

use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::backend::{Backend, BackendError, Image, ModelSpec, SchedulerKind};
use crate::prompt::{self, PromptError};
use crate::store::values::{HighresPass, ModelValues, RequestValues};
use crate::store::{JobStore, StateName, StoreError};
use super::cache::{EntryPoint, PipelineCache, PromptSlot};
use super::params::ResolvedParams;
use super::progress::{ProgressSink, StageId, StageProgress, StateProgress};

/// Job-fatal orchestration failures. The daemon reports them and moves
/// on to the next cycle; the process never dies for one job.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The merged request values do not satisfy the request schema.
    #[error("invalid request values: {0}")]
    InvalidInput(String),

    /// Fatal grammar failure in a prompt.
    #[error(transparent)]
    Prompt(#[from] PromptError),

    /// The backend rejected a load, embed, or generation call.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A state or job record could not be persisted.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stage ran without the cache contents it requires.
    #[error("pipeline cache is missing its {0}")]
    CacheIncomplete(&'static str),
}

/// Drives a [`Backend`] through the stage walk, carrying whatever the
/// cache makes reusable from one job to the next.
pub struct Pipeline<B: Backend> {
    backend: B,
    models_root: PathBuf,
    cache: PipelineCache<B::Model>,
    rng: StdRng,
}

impl<B: Backend> Pipeline<B> {
    pub fn new(backend: B, models_root: PathBuf) -> Self {
        Self {
            backend,
            models_root,
            cache: PipelineCache::default(),
            rng: StdRng::from_entropy(),
        }
    }

    #[cfg(test)]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Runs one job from the store's current values to a final image.
    pub fn text_to_image(
        &mut self,
        store: &mut JobStore,
        observer: &mut dyn ProgressSink,
    ) -> Result<Image, PipelineError> {
        let request = RequestValues::from_value(store.values())
            .map_err(|err| PipelineError::InvalidInput(err.to_string()))?;
        let spec = resolve_model_spec(&self.models_root, &request.model);
        let entry = self.cache.entry_point(&spec, &request.params);
        info!("entering pipeline at {entry}");

        let reload = entry == EntryPoint::LoadModel;
        if reload {
            self.load_model(store, spec, &request)?;
        }
        if reload || entry == EntryPoint::UpdatePrompt {
            self.update_prompts(store, &request)?;
        }

        let params = self.setup_params(store, &request)?;
        self.update_sampler(store, &request.params.sampling_method)?;

        let mut image = self.generate(store, observer, &params)?;
        for (index, pass) in request.params.highres_fix.iter().enumerate() {
            image = self.highres_pass(store, observer, &params, index as u32, pass, image)?;
        }

        store.write_state(StateName::Done, json!({}))?;
        Ok(image)
    }

    fn load_model(
        &mut self,
        store: &JobStore,
        spec: ModelSpec,
        request: &RequestValues,
    ) -> Result<(), PipelineError> {
        store.write_state(StateName::LoadModel, json!({}))?;
        info!("loading model {}", spec.path.display());
        self.cache.clear();
        let mut model = self.backend.load_model(&spec)?;
        for name in &request.textual_inversions {
            if let Err(err) = self
                .backend
                .load_textual_inversion(&mut model, &self.models_root, name)
            {
                warn!("skipping textual inversion: {err}");
            }
        }
        self.cache.install_model(spec, model);
        Ok(())
    }

    fn update_prompts(
        &mut self,
        store: &mut JobStore,
        request: &RequestValues,
    ) -> Result<(), PipelineError> {
        store.write_state(StateName::UpdatePrompt, json!({}))?;
        let (cached_positive, cached_negative) = self.cache.take_prompts();
        let positive = self.refresh_slot(&request.params.prompt, cached_positive)?;
        let negative = self.refresh_slot(&request.params.negative_prompt, cached_negative)?;
        store.record_resolved_prompts(
            &positive.compiled.normalized_text,
            &negative.compiled.normalized_text,
        )?;
        self.cache.install_prompts(positive, negative);
        Ok(())
    }

    /// Resolves and recompiles one prompt, reusing `cached` whole when
    /// the random draw lands on the same normalized text.
    fn refresh_slot(
        &mut self,
        raw: &str,
        cached: Option<PromptSlot>,
    ) -> Result<PromptSlot, PipelineError> {
        let normalized = prompt::resolve_choices(raw, &mut self.rng)?;
        if let Some(slot) = cached
            && slot.compiled.normalized_text == normalized
        {
            return Ok(slot);
        }
        let compiled = prompt::compile(normalized);
        let model = self.cache.model().ok_or(PipelineError::CacheIncomplete("model"))?;
        // The blend starts from the empty-prompt anchor and moves
        // toward each sentence by its layer weight, in emission order.
        let mut blended = self.backend.embed(model, "")?;
        for sentence in &compiled.sentences {
            let embedded = self.backend.embed(model, &sentence.text)?;
            blended.blend_toward(&embedded, sentence.weight);
        }
        Ok(PromptSlot { compiled, embedding: blended })
    }

    fn setup_params(
        &mut self,
        store: &JobStore,
        request: &RequestValues,
    ) -> Result<ResolvedParams, PipelineError> {
        store.write_state(StateName::SetupParams, json!({}))?;
        let params = ResolvedParams::resolve(&request.params, &mut self.rng);
        info!("generating {}x{} over {} steps", params.width, params.height, params.steps);
        Ok(params)
    }

    fn update_sampler(&mut self, store: &JobStore, name: &str) -> Result<(), PipelineError> {
        store.write_state(StateName::UpdateSampler, json!({}))?;
        match SchedulerKind::from_name(name) {
            Some(kind) => {
                let model = self
                    .cache
                    .model_mut()
                    .ok_or(PipelineError::CacheIncomplete("model"))?;
                self.backend.set_scheduler(model, kind)?;
            }
            None => error!("unknown sampling method {name:?}, keeping the previous scheduler"),
        }
        Ok(())
    }

    fn generate(
        &mut self,
        store: &JobStore,
        observer: &mut dyn ProgressSink,
        params: &ResolvedParams,
    ) -> Result<Image, PipelineError> {
        store.write_state(StateName::StartGenerate, json!({}))?;
        let (positive, negative) = self
            .cache
            .prompts()
            .ok_or(PipelineError::CacheIncomplete("prompts"))?;
        let model = self.cache.model().ok_or(PipelineError::CacheIncomplete("model"))?;
        let mut events = StateProgress::new(store, observer);
        let mut steps = StageProgress::new(&mut events, StageId::Txt2Img, params.steps);
        let image = self.backend.generate(
            model,
            &positive.embedding,
            &negative.embedding,
            &params.generate_params(),
            &mut steps,
        )?;
        steps.finish();
        Ok(image)
    }

    fn highres_pass(
        &mut self,
        store: &JobStore,
        observer: &mut dyn ProgressSink,
        params: &ResolvedParams,
        index: u32,
        pass: &HighresPass,
        image: Image,
    ) -> Result<Image, PipelineError> {
        store.write_state(StateName::SetupHighresParams, json!({}))?;
        let (refine, total_steps) = params.refine_params(pass, image.width, image.height);
        info!(
            "highres pass {index}: {}x{} at strength {}",
            refine.width, refine.height, refine.strength
        );

        store.write_state(StateName::StartHighresFix, json!({}))?;
        let (positive, negative) = self
            .cache
            .prompts()
            .ok_or(PipelineError::CacheIncomplete("prompts"))?;
        let model = self.cache.model().ok_or(PipelineError::CacheIncomplete("model"))?;
        let mut events = StateProgress::new(store, observer);
        let mut steps = StageProgress::new(&mut events, StageId::Highres(index), total_steps);
        let refined = self.backend.generate_from_image(
            model,
            &image,
            &positive.embedding,
            &negative.embedding,
            &refine,
            &mut steps,
        )?;
        steps.finish();
        Ok(refined)
    }
}

/// Joins the request's model block against the configured models root.
fn resolve_model_spec(models_root: &Path, model: &ModelValues) -> ModelSpec {
    ModelSpec {
        path: models_root.join(&model.path),
        revision: model.revision.clone(),
        variant: model.variant.clone(),
        clip_skip: model.clip_skip,
        lora_path: model.lora_path.as_ref().map(|p| models_root.join(p)),
        lora_alpha: model.lora_alpha,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Embedding, GenerateParams, RefineParams, StepSink};
    use crate::config::DaemonConfig;
    use crate::store::StateEvent;
    use super::super::progress::NullProgress;
    use serde_json::{Value, json};
    use std::fs;
    use tempfile::{TempDir, tempdir};

    /// Scripted backend that records every call it receives.
    #[derive(Default)]
    struct MockBackend {
        loads: Vec<ModelSpec>,
        inversions: Vec<String>,
        embeds: Vec<String>,
        schedulers: Vec<SchedulerKind>,
        generates: Vec<GenerateParams>,
        refines: Vec<RefineParams>,
        fail_load: bool,
        fail_inversions: bool,
    }

    struct MockModel;

    impl Backend for MockBackend {
        type Model = MockModel;

        fn load_model(&mut self, spec: &ModelSpec) -> Result<MockModel, BackendError> {
            if self.fail_load {
                return Err(BackendError::ModelLoad("scripted failure".to_string()));
            }
            self.loads.push(spec.clone());
            Ok(MockModel)
        }

        fn load_textual_inversion(
            &mut self,
            _model: &mut MockModel,
            _models_root: &Path,
            name: &str,
        ) -> Result<(), BackendError> {
            if self.fail_inversions {
                return Err(BackendError::TextualInversion {
                    name: name.to_string(),
                    reason: "scripted failure".to_string(),
                });
            }
            self.inversions.push(name.to_string());
            Ok(())
        }

        fn embed(&mut self, _model: &MockModel, sentence: &str) -> Result<Embedding, BackendError> {
            self.embeds.push(sentence.to_string());
            Ok(Embedding(vec![self.embeds.len() as f32, 0.0]))
        }

        fn set_scheduler(
            &mut self,
            _model: &mut MockModel,
            kind: SchedulerKind,
        ) -> Result<(), BackendError> {
            self.schedulers.push(kind);
            Ok(())
        }

        fn generate(
            &mut self,
            _model: &MockModel,
            _positive: &Embedding,
            _negative: &Embedding,
            params: &GenerateParams,
            steps: &mut dyn StepSink,
        ) -> Result<Image, BackendError> {
            self.generates.push(params.clone());
            for step in 0..params.steps {
                steps.on_step(step);
            }
            Ok(Image { width: params.width, height: params.height, data: vec![7] })
        }

        fn generate_from_image(
            &mut self,
            _model: &MockModel,
            image: &Image,
            _positive: &Embedding,
            _negative: &Embedding,
            params: &RefineParams,
            steps: &mut dyn StepSink,
        ) -> Result<Image, BackendError> {
            self.refines.push(params.clone());
            let effective = (params.steps as f64 * params.strength) as u32;
            for step in 0..effective {
                steps.on_step(step);
            }
            Ok(Image { width: params.width, height: params.height, data: image.data.clone() })
        }
    }

    #[derive(Default)]
    struct RecordingProgress {
        events: Vec<(StageId, u32, u32)>,
    }

    impl ProgressSink for RecordingProgress {
        fn on_step(&mut self, stage: StageId, step: u32, total_steps: u32) {
            self.events.push((stage, step, total_steps));
        }
    }

    fn base_values(prompt: &str) -> Value {
        json!({
            "model": {"path": "sd15"},
            "params": {
                "prompt": prompt,
                "negative_prompt": "",
                "width": 64,
                "height": 64,
                "sampling_steps": 8,
                "cfg_scale": 7.0,
                "sampling_method": "Euler"
            }
        })
    }

    fn store_with(values: Value, dir: &TempDir) -> JobStore {
        let config = DaemonConfig {
            password: "pw".to_string(),
            models_root: dir.path().join("models"),
            state_root: dir.path().join("state"),
            outputs_root: dir.path().join("outputs"),
            save_raw: false,
            image_format: "png".to_string(),
            init_values: values,
        };
        let mut store = JobStore::open(&config).unwrap();
        store.start_job().unwrap();
        store
    }

    fn merge_and_restart(store: &mut JobStore, dir: &TempDir, patch: Value) {
        fs::write(dir.path().join("state/values.json"), patch.to_string()).unwrap();
        store.merge_values().unwrap();
        store.start_job().unwrap();
    }

    fn read_state(dir: &TempDir) -> StateEvent {
        let raw = fs::read_to_string(dir.path().join("state/state.json")).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    fn pipeline(dir: &TempDir) -> Pipeline<MockBackend> {
        Pipeline::new(MockBackend::default(), dir.path().join("models"))
    }

    // --- entry selection and caching ---

    #[test]
    fn first_job_loads_embeds_and_generates() {
        let dir = tempdir().unwrap();
        let mut store = store_with(base_values("a cat"), &dir);
        let mut pipeline = pipeline(&dir);
        let image = pipeline.text_to_image(&mut store, &mut NullProgress).unwrap();

        assert_eq!((image.width, image.height), (64, 64));
        assert_eq!(pipeline.backend().loads.len(), 1);
        assert_eq!(pipeline.backend().loads[0].path, dir.path().join("models/sd15"));
        // Empty anchor plus one sentence for the positive prompt, then
        // just the anchor for the empty negative prompt.
        assert_eq!(pipeline.backend().embeds, vec!["", "a cat", ""]);
        assert_eq!(pipeline.backend().schedulers, vec![SchedulerKind::Euler]);
        assert_eq!(read_state(&dir).name, StateName::Done);
    }

    #[test]
    fn identical_request_reenters_at_setup_params() {
        let dir = tempdir().unwrap();
        let mut store = store_with(base_values("a cat"), &dir);
        let mut pipeline = pipeline(&dir);
        pipeline.text_to_image(&mut store, &mut NullProgress).unwrap();

        store.start_job().unwrap();
        pipeline.text_to_image(&mut store, &mut NullProgress).unwrap();
        assert_eq!(pipeline.backend().loads.len(), 1, "model must not reload");
        assert_eq!(pipeline.backend().embeds.len(), 3, "prompts must not re-embed");
        assert_eq!(pipeline.backend().generates.len(), 2);
    }

    #[test]
    fn changed_model_path_forces_a_reload() {
        let dir = tempdir().unwrap();
        let mut store = store_with(base_values("a cat"), &dir);
        let mut pipeline = pipeline(&dir);
        pipeline.text_to_image(&mut store, &mut NullProgress).unwrap();

        merge_and_restart(&mut store, &dir, json!({"model": {"path": "sd21"}}));
        pipeline.text_to_image(&mut store, &mut NullProgress).unwrap();
        assert_eq!(pipeline.backend().loads.len(), 2);
        assert_eq!(pipeline.backend().embeds.len(), 6, "prompts re-embed after a reload");
    }

    #[test]
    fn changed_prompt_reembeds_without_a_reload() {
        let dir = tempdir().unwrap();
        let mut store = store_with(base_values("a cat"), &dir);
        let mut pipeline = pipeline(&dir);
        pipeline.text_to_image(&mut store, &mut NullProgress).unwrap();

        merge_and_restart(&mut store, &dir, json!({"params": {"prompt": "a dog"}}));
        pipeline.text_to_image(&mut store, &mut NullProgress).unwrap();
        assert_eq!(pipeline.backend().loads.len(), 1);
        // Only the positive prompt re-embeds; the unchanged negative
        // slot is reused outright.
        assert_eq!(pipeline.backend().embeds, vec!["", "a cat", "", "", "a dog"]);
    }

    #[test]
    fn resolved_choice_text_lands_in_the_job_record() {
        let dir = tempdir().unwrap();
        let mut store = store_with(base_values("{red;blue} cat"), &dir);
        let mut pipeline = pipeline(&dir);
        pipeline.text_to_image(&mut store, &mut NullProgress).unwrap();

        let raw = fs::read_to_string(dir.path().join("state/current_job.json")).unwrap();
        let record: Value = serde_json::from_str(&raw).unwrap();
        let resolved = record["values"]["params"]["prompt"].as_str().unwrap();
        assert!(resolved == "red cat" || resolved == "blue cat", "got {resolved:?}");
    }

    // --- parameters, samplers, weights ---

    #[test]
    fn end_to_end_rounds_sizes_and_reports_every_step() {
        let dir = tempdir().unwrap();
        let mut values = base_values("a (red:1.5) cat");
        values["params"]["width"] = json!(501);
        values["params"]["height"] = json!(10);
        values["params"]["sampling_steps"] = json!(20);
        let mut store = store_with(values, &dir);
        let mut pipeline = pipeline(&dir);
        let mut progress = RecordingProgress::default();

        pipeline.text_to_image(&mut store, &mut progress).unwrap();

        let generated = &pipeline.backend().generates[0];
        assert_eq!((generated.width, generated.height), (504, 16));
        assert_eq!(generated.steps, 20);
        // Both decomposition layers were embedded after the anchor.
        assert_eq!(pipeline.backend().embeds[1], "a  red  cat");
        assert_eq!(pipeline.backend().embeds[2], "red");
        // 20 raw steps plus the synthetic final event.
        assert_eq!(progress.events.len(), 21);
        assert_eq!(*progress.events.last().unwrap(), (StageId::Txt2Img, 20, 20));
        assert_eq!(read_state(&dir).name, StateName::Done);
    }

    #[test]
    fn explicit_seed_reaches_the_backend() {
        let dir = tempdir().unwrap();
        let mut values = base_values("a cat");
        values["params"]["seed"] = json!("1234");
        let mut store = store_with(values, &dir);
        let mut pipeline = pipeline(&dir);
        pipeline.text_to_image(&mut store, &mut NullProgress).unwrap();
        assert_eq!(pipeline.backend().generates[0].seed, Some(1234));
    }

    #[test]
    fn unknown_sampler_keeps_the_previous_scheduler() {
        let dir = tempdir().unwrap();
        let mut store = store_with(base_values("a cat"), &dir);
        let mut pipeline = pipeline(&dir);
        pipeline.text_to_image(&mut store, &mut NullProgress).unwrap();

        merge_and_restart(&mut store, &dir, json!({"params": {"sampling_method": "Warp"}}));
        pipeline.text_to_image(&mut store, &mut NullProgress).unwrap();
        assert_eq!(pipeline.backend().schedulers, vec![SchedulerKind::Euler]);
        assert_eq!(read_state(&dir).name, StateName::Done, "the job still completes");
    }

    // --- failures ---

    #[test]
    fn invalid_values_fail_before_any_backend_call() {
        let dir = tempdir().unwrap();
        let mut values = base_values("a cat");
        values["params"]["prompt"] = json!(42);
        let mut store = store_with(values, &dir);
        let mut pipeline = pipeline(&dir);

        let err = pipeline.text_to_image(&mut store, &mut NullProgress).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
        assert_eq!(pipeline.backend().loads.len(), 0);
    }

    #[test]
    fn model_load_failure_is_fatal_for_the_job() {
        let dir = tempdir().unwrap();
        let mut store = store_with(base_values("a cat"), &dir);
        let backend = MockBackend { fail_load: true, ..MockBackend::default() };
        let mut pipeline = Pipeline::new(backend, dir.path().join("models"));

        let err = pipeline.text_to_image(&mut store, &mut NullProgress).unwrap_err();
        assert!(matches!(err, PipelineError::Backend(BackendError::ModelLoad(_))));
        assert_eq!(pipeline.backend().generates.len(), 0);
    }

    #[test]
    fn failed_textual_inversions_are_skipped() {
        let dir = tempdir().unwrap();
        let mut values = base_values("a cat");
        values["textual_inversions"] = json!(["style.pt", "chara.pt"]);
        let mut store = store_with(values, &dir);
        let backend = MockBackend { fail_inversions: true, ..MockBackend::default() };
        let mut pipeline = Pipeline::new(backend, dir.path().join("models"));

        pipeline.text_to_image(&mut store, &mut NullProgress).unwrap();
        assert_eq!(read_state(&dir).name, StateName::Done);
        assert!(pipeline.backend().inversions.is_empty());
    }

    #[test]
    fn textual_inversions_apply_only_at_load() {
        let dir = tempdir().unwrap();
        let mut values = base_values("a cat");
        values["textual_inversions"] = json!(["style.pt", "chara.pt"]);
        let mut store = store_with(values, &dir);
        let mut pipeline = pipeline(&dir);

        pipeline.text_to_image(&mut store, &mut NullProgress).unwrap();
        store.start_job().unwrap();
        pipeline.text_to_image(&mut store, &mut NullProgress).unwrap();
        assert_eq!(pipeline.backend().inversions, vec!["style.pt", "chara.pt"]);
    }

    // --- highres passes ---

    #[test]
    fn highres_passes_chain_in_declaration_order() {
        let dir = tempdir().unwrap();
        let mut values = base_values("a cat");
        values["params"]["highres_fix"] = json!([
            {"width": 128, "height": 128, "strength": 0.5},
            {"scale": 2.0, "strength": 0.25}
        ]);
        let mut store = store_with(values, &dir);
        let mut pipeline = pipeline(&dir);
        let mut progress = RecordingProgress::default();

        let image = pipeline.text_to_image(&mut store, &mut progress).unwrap();

        let refines = &pipeline.backend().refines;
        assert_eq!(refines.len(), 2);
        assert_eq!((refines[0].width, refines[0].height), (128, 128));
        // The second pass scales the first pass's output.
        assert_eq!((refines[1].width, refines[1].height), (256, 256));
        assert_eq!((image.width, image.height), (256, 256));

        // 8 steps at strength 0.5 and 0.25: 4 and 2 effective steps,
        // each followed by its synthetic final event.
        let highres_events: Vec<_> = progress
            .events
            .iter()
            .filter(|(stage, _, _)| matches!(stage, StageId::Highres(_)))
            .collect();
        assert_eq!(highres_events.len(), 5 + 3);
        assert_eq!(*progress.events.last().unwrap(), (StageId::Highres(1), 2, 2));
        assert_eq!(read_state(&dir).name, StateName::Done);
    }
}
