//! Request-values schema and the deep-merge rule for layered updates.

use serde::Deserialize;
use serde_json::Value;

/// Deep-merges `src` into `dst`.
///
/// Keys whose values are objects on both sides merge recursively; any
/// other pairing (scalar, array, mismatched shapes) overwrites the
/// destination wholesale.
pub fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (key, src_value) in src_map {
                match dst_map.get_mut(&key) {
                    Some(dst_value) if dst_value.is_object() && src_value.is_object() => {
                        deep_merge(dst_value, src_value);
                    }
                    _ => {
                        dst_map.insert(key, src_value);
                    }
                }
            }
        }
        (dst_slot, src_value) => *dst_slot = src_value,
    }
}

/// Typed view of the request values a job runs with.
///
/// The store keeps values as raw JSON so merges never lose unknown
/// keys; the pipeline materializes this view when a job starts.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestValues {
    pub model: ModelValues,
    pub params: GenerationParams,
    /// Textual-inversion weight files under the models root, applied
    /// right after a model load. A file that fails to load is skipped.
    #[serde(default)]
    pub textual_inversions: Vec<String>,
}

impl RequestValues {
    /// Materializes the typed view from raw merged values.
    pub fn from_value(values: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(values.clone())
    }
}

/// Model selection block; any change here forces a full reload.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelValues {
    pub path: String,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub clip_skip: Option<u32>,
    #[serde(default)]
    pub lora_path: Option<String>,
    #[serde(default)]
    pub lora_alpha: Option<f64>,
}

/// Generation parameter block.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: String,
    /// Requested width; anything that is not an integer falls back to
    /// the minimal canvas at parameter setup.
    #[serde(default, deserialize_with = "lenient_int")]
    pub width: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub height: Option<i64>,
    pub sampling_steps: u32,
    pub cfg_scale: f64,
    pub sampling_method: String,
    /// Raw seed value, parsed leniently at parameter setup so an
    /// unusable seed degrades to nondeterministic generation.
    #[serde(default)]
    pub seed: Option<Value>,
    /// Symmetric width jitter range; pixel area stays constant.
    #[serde(default)]
    pub size_range: Option<f64>,
    #[serde(default)]
    pub highres_fix: Vec<HighresPass>,
}

/// One image-conditioned refinement pass.
#[derive(Debug, Clone, Deserialize)]
pub struct HighresPass {
    #[serde(default, deserialize_with = "lenient_int")]
    pub width: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub height: Option<i64>,
    /// Scale factor relative to the previous stage's output; wins over
    /// absolute width/height when present.
    #[serde(default)]
    pub scale: Option<f64>,
    pub strength: f64,
}

/// Accepts any JSON shape but keeps only integer numbers, so `512.0`
/// and `"512"` are rejected the same way a missing key is.
fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Value::deserialize(deserializer)?.as_i64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // --- deep merge ---

    #[test]
    fn objects_merge_recursively() {
        let mut dst = json!({"params": {"prompt": "cat", "width": 512}});
        deep_merge(&mut dst, json!({"params": {"prompt": "dog"}}));
        assert_eq!(dst, json!({"params": {"prompt": "dog", "width": 512}}));
    }

    #[test]
    fn scalars_and_arrays_overwrite() {
        let mut dst = json!({"steps": 20, "passes": [{"scale": 2.0}]});
        deep_merge(&mut dst, json!({"steps": 30, "passes": []}));
        assert_eq!(dst, json!({"steps": 30, "passes": []}));
    }

    #[test]
    fn mismatched_shapes_overwrite() {
        let mut dst = json!({"model": {"path": "a"}});
        deep_merge(&mut dst, json!({"model": "b"}));
        assert_eq!(dst, json!({"model": "b"}));

        let mut dst = json!({"model": "b"});
        deep_merge(&mut dst, json!({"model": {"path": "a"}}));
        assert_eq!(dst, json!({"model": {"path": "a"}}));
    }

    #[test]
    fn new_keys_are_inserted() {
        let mut dst = json!({"params": {"prompt": "cat"}});
        deep_merge(&mut dst, json!({"params": {"seed": 3}, "ui": true}));
        assert_eq!(dst, json!({"params": {"prompt": "cat", "seed": 3}, "ui": true}));
    }

    // --- typed extraction ---

    fn base_values() -> Value {
        json!({
            "model": {"path": "sd15"},
            "params": {
                "prompt": "a cat",
                "negative_prompt": "",
                "width": 512,
                "height": 512,
                "sampling_steps": 20,
                "cfg_scale": 7.0,
                "sampling_method": "Euler"
            }
        })
    }

    #[test]
    fn minimal_values_extract() {
        let request = RequestValues::from_value(&base_values()).unwrap();
        assert_eq!(request.model.path, "sd15");
        assert_eq!(request.params.width, Some(512));
        assert_eq!(request.params.sampling_method, "Euler");
        assert!(request.params.highres_fix.is_empty());
        assert!(request.textual_inversions.is_empty());
    }

    #[test]
    fn non_integer_dimensions_become_none() {
        let mut values = base_values();
        deep_merge(&mut values, json!({"params": {"width": 512.5, "height": "wide"}}));
        let request = RequestValues::from_value(&values).unwrap();
        assert_eq!(request.params.width, None);
        assert_eq!(request.params.height, None);
    }

    #[test]
    fn non_string_prompt_is_an_error() {
        let mut values = base_values();
        deep_merge(&mut values, json!({"params": {"prompt": 42}}));
        assert!(RequestValues::from_value(&values).is_err());
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let mut values = base_values();
        deep_merge(&mut values, json!({"ui": {"theme": "dark"}, "params": {"custom": true}}));
        assert!(RequestValues::from_value(&values).is_ok());
    }

    #[test]
    fn highres_passes_deserialize() {
        let mut values = base_values();
        deep_merge(
            &mut values,
            json!({"params": {"highres_fix": [
                {"width": 1024, "height": 1024, "strength": 0.7},
                {"scale": 2.0, "strength": 0.4}
            ]}}),
        );
        let request = RequestValues::from_value(&values).unwrap();
        assert_eq!(request.params.highres_fix.len(), 2);
        assert_eq!(request.params.highres_fix[0].width, Some(1024));
        assert_eq!(request.params.highres_fix[1].scale, Some(2.0));
    }
}
