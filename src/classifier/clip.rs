use anyhow::{Result, anyhow};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use hf_hub::{Repo, RepoType, api::sync::Api};
use image::imageops::FilterType;
use std::sync::Mutex;
use tokenizers::Tokenizer;

use super::{Verdict, WhaleDetector};

const MODEL_REPO: &str = "openai/clip-vit-base-patch32";
// safetensors weights only exist on this PR branch
const MODEL_REVISION: &str = "refs/pr/15";
const PAD_TOKEN: &str = "<|endoftext|>";

pub const WHALE_CAPTION: &str = "signs of a whale in the photo";
pub const NO_WHALE_CAPTION: &str = "no whale in the photo";

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_1];

/// Zero-shot whale detector on CLIP ViT-B/32.
///
/// Weights and tokenizer come from the Hugging Face cache and are loaded once;
/// the two captions are tokenized at load time and reused for every image.
pub struct ClipDetector {
    model: Mutex<ClipModel>,
    captions: Tensor,
    image_size: usize,
    device: Device,
}

impl ClipDetector {
    pub fn load() -> Result<Self> {
        #[cfg(feature = "cuda")]
        let device = Device::new_cuda(0).unwrap_or(Device::Cpu);
        #[cfg(all(feature = "metal", not(feature = "cuda")))]
        let device = Device::new_metal(0).unwrap_or(Device::Cpu);
        #[cfg(not(any(feature = "cuda", feature = "metal")))]
        let device = Device::Cpu;

        log::info!("Loading CLIP model on {:?}", device);

        let api = Api::new()?;
        let weights = api
            .repo(Repo::with_revision(
                MODEL_REPO.to_string(),
                RepoType::Model,
                MODEL_REVISION.to_string(),
            ))
            .get("model.safetensors")?;
        let tokenizer_path = api.model(MODEL_REPO.to_string()).get("tokenizer.json")?;

        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(anyhow::Error::msg)?;
        let captions = tokenize_captions(&tokenizer, &[WHALE_CAPTION, NO_WHALE_CAPTION], &device)?;

        let config = ClipConfig::vit_base_patch32();
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)? };
        let model = ClipModel::new(vb, &config)?;

        log::info!("CLIP model loaded successfully");

        Ok(Self {
            model: Mutex::new(model),
            captions,
            image_size: config.image_size,
            device,
        })
    }
}

impl WhaleDetector for ClipDetector {
    fn score(&self, image: &[u8]) -> Result<Verdict> {
        let pixels = preprocess(image, self.image_size, &self.device)?;
        let model = self.model.lock().map_err(|e| anyhow!("Lock error: {}", e))?;

        // logits_per_image: (1 image, 2 captions), scaled cosine similarities
        let (_, logits_per_image) = model.forward(&pixels, &self.captions)?;
        let probs = candle_nn::ops::softmax(&logits_per_image, 1)?;
        let probs: Vec<f32> = probs.flatten_all()?.to_vec1()?;

        let [whale, no_whale] = probs.as_slice() else {
            return Err(anyhow!("expected 2 caption probabilities, got {}", probs.len()));
        };
        let verdict = Verdict {
            whale: *whale,
            no_whale: *no_whale,
        };

        log::info!(
            "[CLIP] whale={:.1}% no_whale={:.1}%",
            verdict.whale * 100.0,
            verdict.no_whale * 100.0
        );
        Ok(verdict)
    }
}

/// Decodes, resizes to fill `size`x`size` (center crop) and normalizes into a
/// (1, 3, size, size) CHW tensor.
fn preprocess(image: &[u8], size: usize, device: &Device) -> Result<Tensor> {
    let img = image::load_from_memory(image)?;
    let rgb = img
        .resize_to_fill(size as u32, size as u32, FilterType::Triangle)
        .to_rgb8();

    let plane = size * size;
    let mut data = vec![0f32; 3 * plane];
    for (i, pixel) in rgb.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (pixel[c] as f32 / 255.0 - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }

    Ok(Tensor::from_vec(data, (1, 3, size, size), device)?)
}

fn tokenize_captions(tokenizer: &Tokenizer, captions: &[&str], device: &Device) -> Result<Tensor> {
    let pad_id = *tokenizer
        .get_vocab(true)
        .get(PAD_TOKEN)
        .ok_or_else(|| anyhow!("tokenizer has no {PAD_TOKEN} token"))?;

    let mut rows = Vec::with_capacity(captions.len());
    for caption in captions {
        let encoding = tokenizer.encode(*caption, true).map_err(anyhow::Error::msg)?;
        rows.push(encoding.get_ids().to_vec());
    }

    let (ids, width) = pad_rows(rows, pad_id);
    Ok(Tensor::from_vec(ids, (captions.len(), width), device)?)
}

/// Right-pads every row to the longest one and flattens them row-major.
fn pad_rows(rows: Vec<Vec<u32>>, pad_id: u32) -> (Vec<u32>, usize) {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut flat = Vec::with_capacity(rows.len() * width);
    for mut row in rows {
        row.resize(width, pad_id);
        flat.extend(row);
    }
    (flat, width)
}
