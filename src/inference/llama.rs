use anyhow::{anyhow, bail, Context, Result};
use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig, LlamaEosToks};
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Repo, RepoType};
use rand::Rng;
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::{GenerationParams, TextGenerator};
use crate::config::ModelSettings;

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const FALLBACK_EOS: &str = "</s>";

/// Hub identifier or a directory already on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Hub(String),
    Local(PathBuf),
}

impl ModelSource {
    /// Existing directories are local models, anything else is a hub id.
    pub fn parse(raw: &str) -> Self {
        let path = Path::new(raw);
        if path.is_dir() {
            ModelSource::Local(path.to_path_buf())
        } else {
            ModelSource::Hub(raw.to_string())
        }
    }
}

pub fn parse_dtype(raw: &str) -> Result<DType> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "f16" | "fp16" | "float16" | "half" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        "f32" | "fp32" | "float32" => Ok(DType::F32),
        other => bail!("unsupported dtype {other:?} (expected f16, bf16 or f32)"),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

/// Shard file names referenced by a safetensors index, deduplicated and sorted.
fn shard_names(index_json: &[u8]) -> Result<Vec<String>> {
    let index: SafetensorsIndex =
        serde_json::from_slice(index_json).context("invalid safetensors index")?;
    let names: BTreeSet<String> = index.weight_map.into_values().collect();
    if names.is_empty() {
        bail!("safetensors index lists no weight files");
    }
    Ok(names.into_iter().collect())
}

fn local_files(dir: &Path) -> Result<ModelFiles> {
    let config = dir.join(CONFIG_FILE);
    let tokenizer = dir.join(TOKENIZER_FILE);
    for required in [&config, &tokenizer] {
        if !required.is_file() {
            bail!("missing {} in {}", required.display(), dir.display());
        }
    }

    let index_path = dir.join(WEIGHTS_INDEX_FILE);
    let weights = if index_path.is_file() {
        let raw = fs::read(&index_path)
            .with_context(|| format!("reading {}", index_path.display()))?;
        shard_names(&raw)?
            .into_iter()
            .map(|name| dir.join(name))
            .collect()
    } else {
        let single = dir.join(SINGLE_WEIGHTS_FILE);
        if !single.is_file() {
            bail!("no safetensors weights found in {}", dir.display());
        }
        vec![single]
    };

    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}

fn hub_files(settings: &ModelSettings, model_id: &str) -> Result<ModelFiles> {
    // Without an explicit token the builder keeps the one from `huggingface-cli login`.
    let mut builder = ApiBuilder::new().with_progress(true);
    if let Some(token) = &settings.hf_token {
        builder = builder.with_token(Some(token.clone()));
    }
    let api = builder
        .build()
        .context("unable to create huggingface api")?;
    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        settings.revision.clone(),
    ));

    let config = repo
        .get(CONFIG_FILE)
        .with_context(|| format!("downloading {CONFIG_FILE} for {model_id}"))?;
    let tokenizer = repo
        .get(TOKENIZER_FILE)
        .with_context(|| format!("downloading {TOKENIZER_FILE} for {model_id}"))?;

    let weights = match repo.get(WEIGHTS_INDEX_FILE) {
        Ok(index_path) => {
            let raw = fs::read(&index_path)?;
            shard_names(&raw)?
                .iter()
                .map(|name| {
                    repo.get(name)
                        .with_context(|| format!("downloading shard {name} for {model_id}"))
                })
                .collect::<Result<Vec<_>>>()?
        }
        Err(err) => {
            debug!(%err, "no sharded index, falling back to single weights file");
            vec![repo
                .get(SINGLE_WEIGHTS_FILE)
                .with_context(|| format!("downloading {SINGLE_WEIGHTS_FILE} for {model_id}"))?]
        }
    };

    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}

pub fn resolve_files(settings: &ModelSettings) -> Result<ModelFiles> {
    match &settings.source {
        ModelSource::Local(dir) => local_files(dir),
        ModelSource::Hub(id) => hub_files(settings, id),
    }
}

/// End-of-sequence ids; generation stops on any of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EosTokens(Vec<u32>);

impl EosTokens {
    fn resolve(config: Option<&LlamaEosToks>, tokenizer_eos: Option<u32>) -> Self {
        let ids = match config {
            Some(LlamaEosToks::Single(id)) => vec![*id],
            Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
            None => tokenizer_eos.into_iter().collect(),
        };
        Self(ids)
    }

    pub fn contains(&self, token: u32) -> bool {
        self.0.contains(&token)
    }
}

/// Clips the requested number of new tokens to the model's context window.
fn token_budget(prompt_len: usize, max_new_tokens: usize, max_positions: usize) -> Result<usize> {
    if prompt_len >= max_positions {
        bail!("prompt of {prompt_len} tokens does not fit the model context of {max_positions}");
    }
    Ok(max_new_tokens.min(max_positions - prompt_len))
}

fn sampling_for(params: &GenerationParams) -> Sampling {
    if !params.do_sample || params.temperature <= 0.0 {
        return Sampling::ArgMax;
    }
    if params.top_p < 1.0 {
        Sampling::TopP {
            p: params.top_p,
            temperature: params.temperature,
        }
    } else {
        Sampling::All {
            temperature: params.temperature,
        }
    }
}

fn pick_device(force_cpu: bool) -> Result<Device> {
    if force_cpu {
        return Ok(Device::Cpu);
    }
    Ok(Device::cuda_if_available(0)?)
}

fn default_dtype(device: &Device) -> DType {
    if device.is_cuda() {
        DType::F16
    } else {
        DType::F32
    }
}

/// Loaded Llama weights plus tokenizer, kept alive for the whole chat.
pub struct LlamaService {
    model: Llama,
    config: Config,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    eos: EosTokens,
}

impl LlamaService {
    pub fn load(settings: &ModelSettings) -> Result<Self> {
        // -------------------------
        // Device + precision
        // -------------------------
        let device = pick_device(settings.force_cpu)?;
        let dtype = settings.dtype.unwrap_or_else(|| default_dtype(&device));
        println!("🔌 Llama → Using {device:?} ({dtype:?})");
        info!(source = ?settings.source, ?device, ?dtype, "loading llama model");

        let files = resolve_files(settings)?;
        let model_dir = files.config.parent().unwrap_or(&files.config);
        println!("📁 Model files: {}", model_dir.display());

        // -------------------------
        // Tokenizer
        // -------------------------
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("Tokenizer load error: {e}"))?;
        check_tokenizer_round_trip(&tokenizer);

        // -------------------------
        // Config
        // -------------------------
        let raw_config = fs::read(&files.config)
            .with_context(|| format!("reading {}", files.config.display()))?;
        let llama_config: LlamaConfig =
            serde_json::from_slice(&raw_config).context("invalid llama config.json")?;
        let config = llama_config.into_config(false);

        // -------------------------
        // Weights
        // -------------------------
        println!("📦 Found {} Llama shards", files.weights.len());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
        let model = Llama::load(vb, &config)?;

        let eos = EosTokens::resolve(
            config.eos_token_id.as_ref(),
            tokenizer.token_to_id(FALLBACK_EOS),
        );
        if eos.0.is_empty() {
            warn!("model has no eos token; generation always runs to the token limit");
        }

        println!("🚀 Llama loaded with KV cache enabled");

        Ok(Self {
            model,
            config,
            tokenizer,
            device,
            dtype,
            eos,
        })
    }
}

impl TextGenerator for LlamaService {
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let started = Instant::now();

        let enc = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!("Tokenizer encode error: {e}"))?;
        let mut tokens = enc.get_ids().to_vec();
        let prompt_len = tokens.len();
        let budget = token_budget(
            prompt_len,
            params.max_new_tokens,
            self.config.max_position_embeddings,
        )?;

        let seed = params.seed.unwrap_or_else(|| rand::thread_rng().gen());
        let mut lp = LogitsProcessor::from_sampling(seed, sampling_for(params));
        let mut cache = Cache::new(true, self.dtype, &self.config, &self.device)?;
        let mut pos = 0usize;

        for _ in 0..budget {
            let ctx: &[u32] = if pos == 0 {
                &tokens
            } else {
                &tokens[tokens.len() - 1..]
            };

            let input = Tensor::new(ctx, &self.device)?.unsqueeze(0)?;
            let logits = self
                .model
                .forward(&input, pos, &mut cache)?
                .squeeze(0)?
                .to_dtype(DType::F32)?;
            pos += ctx.len();

            let next = lp.sample(&logits)?;
            tokens.push(next);
            if self.eos.contains(next) {
                break;
            }
        }

        let generated = tokens.len() - prompt_len;
        let elapsed = started.elapsed();
        debug!(
            prompt_tokens = prompt_len,
            generated,
            elapsed_ms = elapsed.as_millis() as u64,
            "generation finished"
        );

        self.tokenizer
            .decode(&tokens, true)
            .map_err(|e| anyhow!("decode error: {e}"))
    }
}

/// Emoji survive a round trip through a healthy Llama tokenizer.
fn check_tokenizer_round_trip(tokenizer: &Tokenizer) {
    let decoded = tokenizer
        .encode("😊", false)
        .and_then(|enc| tokenizer.decode(enc.get_ids(), false));
    match decoded {
        Ok(text) if !text.contains('\u{FFFD}') => debug!("tokenizer emoji round trip ok"),
        Ok(text) => warn!(%text, "tokenizer emits replacement characters"),
        Err(err) => warn!(%err, "tokenizer round trip failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_ids_and_missing_paths_are_hub_sources() {
        assert_eq!(
            ModelSource::parse("meta-llama/Llama-2-7b-chat-hf"),
            ModelSource::Hub("meta-llama/Llama-2-7b-chat-hf".into())
        );
        assert_eq!(
            ModelSource::parse("./does-not-exist"),
            ModelSource::Hub("./does-not-exist".into())
        );
    }

    #[test]
    fn dtype_names() {
        assert_eq!(parse_dtype("f16").unwrap(), DType::F16);
        assert_eq!(parse_dtype(" Float16 ").unwrap(), DType::F16);
        assert_eq!(parse_dtype("bf16").unwrap(), DType::BF16);
        assert_eq!(parse_dtype("f32").unwrap(), DType::F32);
        assert!(parse_dtype("int8").is_err());
    }

    #[test]
    fn shard_names_are_deduplicated_and_sorted() {
        let index = br#"{
            "metadata": {"total_size": 13476839424},
            "weight_map": {
                "lm_head.weight": "model-00002-of-00002.safetensors",
                "model.embed_tokens.weight": "model-00001-of-00002.safetensors",
                "model.norm.weight": "model-00002-of-00002.safetensors"
            }
        }"#;
        assert_eq!(
            shard_names(index).unwrap(),
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string(),
            ]
        );
    }

    #[test]
    fn empty_index_is_rejected() {
        assert!(shard_names(br#"{"weight_map": {}}"#).is_err());
        assert!(shard_names(b"not json").is_err());
    }

    #[test]
    fn local_dir_with_sharded_weights() {
        let tmp = tempfile::Builder::new().prefix("llama-sharded").tempdir().unwrap();
        let dir = tmp.path();
        fs::write(dir.join(CONFIG_FILE), "{}").unwrap();
        fs::write(dir.join(TOKENIZER_FILE), "{}").unwrap();
        fs::write(
            dir.join(WEIGHTS_INDEX_FILE),
            r#"{"weight_map": {"a": "b.safetensors", "c": "a.safetensors"}}"#,
        )
        .unwrap();

        let files = local_files(dir).unwrap();
        assert_eq!(files.config, dir.join(CONFIG_FILE));
        assert_eq!(
            files.weights,
            vec![dir.join("a.safetensors"), dir.join("b.safetensors")]
        );
    }

    #[test]
    fn local_dir_with_single_weights_file() {
        let tmp = tempfile::Builder::new().prefix("llama-single").tempdir().unwrap();
        let dir = tmp.path();
        fs::write(dir.join(CONFIG_FILE), "{}").unwrap();
        fs::write(dir.join(TOKENIZER_FILE), "{}").unwrap();
        fs::write(dir.join(SINGLE_WEIGHTS_FILE), b"").unwrap();

        let files = local_files(dir).unwrap();
        assert_eq!(files.weights, vec![dir.join(SINGLE_WEIGHTS_FILE)]);
    }

    #[test]
    fn local_dir_without_tokenizer_fails() {
        let tmp = tempfile::Builder::new().prefix("llama-broken").tempdir().unwrap();
        let dir = tmp.path();
        fs::write(dir.join(CONFIG_FILE), "{}").unwrap();

        let err = local_files(dir).unwrap_err().to_string();
        assert!(err.contains(TOKENIZER_FILE), "{err}");
    }

    #[test]
    fn eos_prefers_model_config() {
        let single = EosTokens::resolve(Some(&LlamaEosToks::Single(2)), Some(7));
        assert!(single.contains(2));
        assert!(!single.contains(7));

        let multi = EosTokens::resolve(Some(&LlamaEosToks::Multiple(vec![128001, 128009])), None);
        assert!(multi.contains(128009));

        let fallback = EosTokens::resolve(None, Some(2));
        assert!(fallback.contains(2));

        let none = EosTokens::resolve(None, None);
        assert!(!none.contains(0));
    }

    #[test]
    fn budget_is_clipped_to_context() {
        assert_eq!(token_budget(10, 200, 4096).unwrap(), 200);
        assert_eq!(token_budget(4000, 200, 4096).unwrap(), 96);
        assert!(token_budget(4096, 200, 4096).is_err());
    }

    #[test]
    fn sampling_follows_params() {
        let params = GenerationParams::default();
        assert!(matches!(
            sampling_for(&params),
            Sampling::TopP { p, temperature } if p == 0.9 && temperature == 0.7
        ));

        let greedy = GenerationParams {
            do_sample: false,
            ..GenerationParams::default()
        };
        assert!(matches!(sampling_for(&greedy), Sampling::ArgMax));

        let full = GenerationParams {
            top_p: 1.0,
            ..GenerationParams::default()
        };
        assert!(matches!(sampling_for(&full), Sampling::All { temperature } if temperature == 0.7));
    }

    #[test]
    fn cpu_defaults_to_f32() {
        assert_eq!(default_dtype(&Device::Cpu), DType::F32);
        assert!(matches!(pick_device(true).unwrap(), Device::Cpu));
    }
}
