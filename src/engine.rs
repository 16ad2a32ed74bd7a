use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::{blip, quantized_blip};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use tokenizers::Tokenizer;

use crate::beam::BeamSearch;
use crate::config::CaptionConfig;
use crate::error::CaptionError;
use crate::preprocess::ImagePreprocessor;

/// BLIP's decoder prompt (`[DEC]`).
pub const BLIP_BOS_TOKEN_ID: u32 = 30522;
/// BLIP ends captions with `[SEP]`.
pub const BLIP_EOS_TOKEN_ID: u32 = 102;

/// Captioning entry point the HTTP layer depends on.
#[async_trait]
pub trait CaptionEngine: Send + Sync {
    /// Identifier of the model behind this engine.
    fn model_id(&self) -> &str;

    /// Decodes `image`, runs generation and returns the best caption.
    async fn caption(&self, image: Vec<u8>) -> Result<String, CaptionError>;
}

enum CaptionModel {
    Full(blip::BlipForConditionalGeneration),
    Quantized(quantized_blip::BlipForConditionalGeneration),
}

impl CaptionModel {
    fn embed_image(&self, pixels: &Tensor) -> candle_core::Result<Tensor> {
        let batch = pixels.unsqueeze(0)?;
        match self {
            Self::Full(model) => model.vision_model().forward(&batch),
            Self::Quantized(model) => model.vision_model().forward(&batch),
        }
    }

    /// Log-probabilities of the token following `tokens`.
    ///
    /// Every beam has its own history, so the decoder cache is cleared and the
    /// whole sequence is replayed on each call.
    fn next_log_probs(
        &mut self,
        tokens: &[u32],
        image_embeds: &Tensor,
        device: &Device,
    ) -> candle_core::Result<Vec<f32>> {
        let input_ids = Tensor::new(tokens, device)?.unsqueeze(0)?;
        let logits = match self {
            Self::Full(model) => {
                model.reset_kv_cache();
                model.text_decoder().forward(&input_ids, image_embeds)?
            }
            Self::Quantized(model) => {
                model.reset_kv_cache();
                model.text_decoder().forward(&input_ids, image_embeds)?
            }
        };
        let logits = logits.squeeze(0)?;
        let logits = logits.get(logits.dim(0)? - 1)?.to_dtype(DType::F32)?;
        candle_nn::ops::log_softmax(&logits, D::Minus1)?.to_vec1::<f32>()
    }
}

/// Model, tokenizer and preprocessor, built once and shared by every request.
pub struct ModelBundle {
    model_id: String,
    device: Device,
    model: Mutex<CaptionModel>,
    tokenizer: Tokenizer,
    preprocessor: ImagePreprocessor,
    search: BeamSearch,
}

impl ModelBundle {
    /// Fetches weights and tokenizer from the HF Hub (or its local cache).
    pub fn load(config: &CaptionConfig) -> Result<Self> {
        let device = Device::Cpu;
        let start = Instant::now();

        let api = Api::new()?;
        let repo = api.repo(Repo::with_revision(
            config.model_id.clone(),
            RepoType::Model,
            config.revision.clone(),
        ));

        let tokenizer_path = repo.get("tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Error loading tokenizer: {e}"))?;

        let blip_config = blip::Config::image_captioning_large();
        let model = if config.quantized {
            let weights = api
                .model(config.quantized_model_id.clone())
                .get(&config.quantized_weights)?;
            tracing::info!(path = %weights.display(), "loading quantized weights");
            let vb = quantized_blip::VarBuilder::from_gguf(&weights, &device)?;
            CaptionModel::Quantized(quantized_blip::BlipForConditionalGeneration::new(
                &blip_config,
                vb,
            )?)
        } else {
            let weights = repo.get("model.safetensors")?;
            tracing::info!(path = %weights.display(), "loading safetensors weights");
            // The cached weights file is never written while mapped.
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)? };
            CaptionModel::Full(blip::BlipForConditionalGeneration::new(&blip_config, vb)?)
        };

        let preprocessor = ImagePreprocessor::blip();
        let search = BeamSearch::new(config.num_beams, config.max_length, BLIP_EOS_TOKEN_ID)
            .with_length_penalty(config.length_penalty);

        tracing::info!(
            model = %config.served_model(),
            image_size = preprocessor.size(),
            num_beams = search.width,
            max_length = search.max_length,
            "model ready in {:.2}s",
            start.elapsed().as_secs_f32(),
        );

        Ok(Self::from_parts(
            config.served_model(),
            model,
            tokenizer,
            preprocessor,
            search,
        ))
    }

    fn from_parts(
        model_id: String,
        model: CaptionModel,
        tokenizer: Tokenizer,
        preprocessor: ImagePreprocessor,
        search: BeamSearch,
    ) -> Self {
        Self {
            model_id,
            device: Device::Cpu,
            model: Mutex::new(model),
            tokenizer,
            preprocessor,
            search,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Synchronous, CPU-bound captioning of one encoded image.
    pub fn caption(&self, image: &[u8]) -> Result<String, CaptionError> {
        let start = Instant::now();
        let pixels = self.preprocessor.preprocess(image, &self.device)?;

        let token_ids = {
            let mut model = self.model.lock();
            let image_embeds = model.embed_image(&pixels)?;
            self.search.run(&[BLIP_BOS_TOKEN_ID], |tokens| {
                model.next_log_probs(tokens, &image_embeds, &self.device)
            })?
        };

        let caption = self
            .tokenizer
            .decode(&token_ids, true)
            .map_err(|e| CaptionError::Detokenize(e.to_string()))?;
        let caption = caption.trim().to_string();

        tracing::debug!(
            tokens = token_ids.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            %caption,
            "generated caption"
        );
        Ok(caption)
    }
}

/// Engine backed by a loaded [`ModelBundle`]; inference runs on the blocking pool.
pub struct BlipEngine {
    bundle: Arc<ModelBundle>,
}

impl BlipEngine {
    pub fn new(bundle: ModelBundle) -> Arc<Self> {
        Arc::new(Self {
            bundle: Arc::new(bundle),
        })
    }

    pub fn load(config: &CaptionConfig) -> Result<Arc<Self>> {
        Ok(Self::new(ModelBundle::load(config)?))
    }
}

#[async_trait]
impl CaptionEngine for BlipEngine {
    fn model_id(&self) -> &str {
        self.bundle.model_id()
    }

    async fn caption(&self, image: Vec<u8>) -> Result<String, CaptionError> {
        let bundle = Arc::clone(&self.bundle);
        tokio::task::spawn_blocking(move || bundle.caption(&image))
            .await
            .map_err(|e| CaptionError::Worker(e.to_string()))?
    }
}
