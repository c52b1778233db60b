use serde::{Deserialize, Serialize};

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";

/// Sampling parameters sent with every streaming request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: Some(0.9),
            top_k: Some(1),
            top_p: Some(1.0),
            max_output_tokens: Some(2048),
        }
    }
}

impl GenerationConfig {
    pub fn unset() -> Self {
        Self {
            temperature: None,
            top_k: None,
            top_p: None,
            max_output_tokens: None,
        }
    }

    /// Provider-specific knobs with no first-class builder method.
    pub fn additional_params(&self) -> Option<serde_json::Value> {
        let mut generation = serde_json::Map::new();
        if let Some(top_k) = self.top_k {
            generation.insert("topK".to_string(), top_k.into());
        }
        if let Some(top_p) = self.top_p {
            generation.insert("topP".to_string(), top_p.into());
        }

        if generation.is_empty() {
            None
        } else {
            Some(serde_json::json!({ "generationConfig": generation }))
        }
    }
}
