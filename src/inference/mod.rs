pub mod llama;

use anyhow::Result;

pub const DEFAULT_MAX_NEW_TOKENS: usize = 200;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.9;

/// Sampling configuration handed unchanged to every generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub temperature: f64,
    pub top_p: f64,
    /// `None` draws a fresh seed per call.
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            do_sample: true,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            seed: None,
        }
    }
}

/// Anything that turns a prompt into decoded text.
///
/// Implementations return the full decoded sequence, prompt echo included;
/// callers strip the echo themselves.
pub trait TextGenerator {
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String>;
}
