//! Silero VAD provider using ONNX Runtime
//!
//! The model evaluates 512-sample windows (32 ms at 16 kHz) and returns a
//! speech probability. Hidden state persists across windows, so each session
//! gets its own inference instance.

use anyhow::{Context, Result};
use ort::session::Session;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::info;

const SILERO_VAD_URL: &str =
    "https://github.com/snakers4/silero-vad/raw/master/src/silero_vad/data/silero_vad.onnx";
const SAMPLE_RATE: i64 = 16_000;

/// Factory for per-session VAD model instances, plus the gate tuning knobs
/// that travel with the model choice.
pub trait Vad: Send + Sync {
    fn new_session(&self) -> Result<Box<dyn VadSession>>;
    /// Speech-probability threshold above which a window counts as voice.
    fn threshold(&self) -> f32;
    /// Minimum silence after the last speech window before end-of-speech.
    fn min_silence_ms(&self) -> u64;
}

/// Stateful per-connection inference instance.
pub trait VadSession: Send {
    /// Speech probability for one 512-sample window of normalized f32 audio.
    fn speech_probability(&mut self, window: &[f32]) -> Result<f32>;
    /// Clear hidden state between utterance streams.
    fn reset(&mut self);
}

#[derive(Debug, Clone, Deserialize)]
pub struct SileroVadConfig {
    #[serde(default = "default_model_path")]
    pub model_path: String,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_min_silence")]
    pub min_silence_duration_ms: u64,
}

fn default_model_path() -> String {
    "models/silero_vad.onnx".to_string()
}

fn default_threshold() -> f32 {
    0.5
}

fn default_min_silence() -> u64 {
    100
}

pub struct SileroVad {
    model_path: PathBuf,
    config: SileroVadConfig,
}

impl SileroVad {
    /// Load the provider, downloading the model (~2 MB) on first use.
    pub async fn load(block: serde_yaml::Value) -> Result<Self> {
        let config: SileroVadConfig = if block.is_null() {
            serde_yaml::from_str("{}").expect("empty config")
        } else {
            serde_yaml::from_value(block).context("invalid SileroVAD config")?
        };
        let model_path = PathBuf::from(&config.model_path);
        if !model_path.exists() {
            Self::download_model(&model_path).await?;
        }
        Ok(Self { model_path, config })
    }

    async fn download_model(path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create models directory")?;
        }
        info!("Downloading Silero VAD model to {}", path.display());
        let response = reqwest::get(SILERO_VAD_URL)
            .await
            .context("failed to download Silero VAD model")?;
        if !response.status().is_success() {
            anyhow::bail!("Silero VAD model download failed: HTTP {}", response.status());
        }
        let bytes = response.bytes().await.context("failed to read model bytes")?;
        std::fs::write(path, &bytes).context("failed to save Silero VAD model")?;
        info!("Silero VAD model downloaded ({} bytes)", bytes.len());
        Ok(())
    }
}

impl Vad for SileroVad {
    fn new_session(&self) -> Result<Box<dyn VadSession>> {
        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(&self.model_path)
            .context("failed to create ONNX session for Silero VAD")?;
        Ok(Box::new(SileroSession {
            session,
            // h and c states, shape (2, 1, 128)
            state: vec![0.0f32; 2 * 1 * 128],
        }))
    }

    fn threshold(&self) -> f32 {
        self.config.threshold
    }

    fn min_silence_ms(&self) -> u64 {
        self.config.min_silence_duration_ms
    }
}

struct SileroSession {
    session: Session,
    state: Vec<f32>,
}

impl VadSession for SileroSession {
    fn speech_probability(&mut self, window: &[f32]) -> Result<f32> {
        use ort::value::Value;

        let input = Value::from_array(([1usize, window.len()], window.to_vec()))?;
        let state = Value::from_array(([2usize, 1usize, 128usize], self.state.clone()))?;
        let sr = Value::from_array(([1usize], vec![SAMPLE_RATE]))?;

        let outputs = self.session.run(ort::inputs![input, state, sr])?;

        let (_prob_shape, prob_data) = outputs[0].try_extract_tensor::<f32>()?;
        let prob = prob_data.first().copied().unwrap_or(0.0);

        let (_state_shape, new_state) = outputs[1].try_extract_tensor::<f32>()?;
        if new_state.len() == self.state.len() {
            self.state.copy_from_slice(new_state);
        }

        Ok(prob)
    }

    fn reset(&mut self) {
        self.state.fill(0.0);
    }
}
