use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use candle::DType;

use crate::inference::llama::{parse_dtype, ModelSource};
use crate::inference::GenerationParams;

pub const DEFAULT_MODEL: &str = "meta-llama/Llama-2-7b-chat-hf";
pub const DEFAULT_REVISION: &str = "main";

pub const DEFAULT_RUNNER_PROGRAM: &str = "ollama";
pub const DEFAULT_RUNNER_MODEL: &str = "llama2";
pub const DEFAULT_RUNNER_TEMPERATURE: &str = "0.7";
pub const DEFAULT_RUNNER_MAX_TOKENS: &str = "1000";

/// Where and how to load the chat model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub source: ModelSource,
    pub revision: String,
    pub hf_token: Option<String>,
    /// `None` picks f16 on CUDA and f32 on CPU.
    pub dtype: Option<DType>,
    pub force_cpu: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            source: ModelSource::Hub(DEFAULT_MODEL.to_string()),
            revision: DEFAULT_REVISION.to_string(),
            hf_token: None,
            dtype: None,
            force_cpu: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatConfig {
    pub model: ModelSettings,
    pub generation: GenerationParams,
}

impl ChatConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = GenerationParams::default();

        let source = match value(&lookup, "LLAMA_MODEL") {
            Some(raw) => ModelSource::parse(&raw),
            None => ModelSource::Hub(DEFAULT_MODEL.to_string()),
        };

        let dtype = value(&lookup, "LLAMA_DTYPE")
            .map(|raw| parse_dtype(&raw).map_err(|e| anyhow!("LLAMA_DTYPE: {e}")))
            .transpose()?;

        let model = ModelSettings {
            source,
            revision: value(&lookup, "LLAMA_REVISION").unwrap_or_else(|| DEFAULT_REVISION.into()),
            hf_token: value(&lookup, "HF_TOKEN"),
            dtype,
            force_cpu: flag(&lookup, "LLAMA_CPU", false)?,
        };

        let generation = GenerationParams {
            max_new_tokens: parsed(&lookup, "LLAMA_MAX_NEW_TOKENS", defaults.max_new_tokens)?,
            do_sample: flag(&lookup, "LLAMA_DO_SAMPLE", defaults.do_sample)?,
            temperature: parsed(&lookup, "LLAMA_TEMPERATURE", defaults.temperature)?,
            top_p: parsed(&lookup, "LLAMA_TOP_P", defaults.top_p)?,
            seed: value(&lookup, "LLAMA_SEED")
                .map(|raw| parse_named::<u64>("LLAMA_SEED", &raw))
                .transpose()?,
        };

        if generation.max_new_tokens == 0 {
            return Err(anyhow!("LLAMA_MAX_NEW_TOKENS must be at least 1"));
        }
        if !(generation.top_p > 0.0 && generation.top_p <= 1.0) {
            return Err(anyhow!("LLAMA_TOP_P must be in (0, 1], got {}", generation.top_p));
        }
        if generation.temperature < 0.0 {
            return Err(anyhow!(
                "LLAMA_TEMPERATURE must not be negative, got {}",
                generation.temperature
            ));
        }

        Ok(Self { model, generation })
    }
}

/// Settings for the external model-runner invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    pub program: String,
    pub model: String,
    pub temperature: String,
    pub max_tokens: String,
    pub timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_RUNNER_PROGRAM.into(),
            model: DEFAULT_RUNNER_MODEL.into(),
            temperature: DEFAULT_RUNNER_TEMPERATURE.into(),
            max_tokens: DEFAULT_RUNNER_MAX_TOKENS.into(),
            timeout: None,
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let timeout = value(&lookup, "RUNNER_TIMEOUT_SECS")
            .map(|raw| parse_named::<u64>("RUNNER_TIMEOUT_SECS", &raw))
            .transpose()?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            program: value(&lookup, "RUNNER_PROGRAM").unwrap_or(defaults.program),
            model: value(&lookup, "RUNNER_MODEL").unwrap_or(defaults.model),
            temperature: value(&lookup, "RUNNER_TEMPERATURE").unwrap_or(defaults.temperature),
            max_tokens: value(&lookup, "RUNNER_MAX_TOKENS").unwrap_or(defaults.max_tokens),
            timeout,
        })
    }
}

fn value<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match value(lookup, key) {
        Some(raw) => parse_named(key, &raw),
        None => Ok(default),
    }
}

fn parse_named<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse::<T>()
        .map_err(|e| anyhow!("{key}: invalid value {raw:?}: {e}"))
}

fn flag<F>(lookup: &F, key: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = value(lookup, key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{key}: expected a boolean, got {raw:?}")),
    }
}
