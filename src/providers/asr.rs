//! Speech recognition provider
//!
//! Thin HTTP front for a recognizer service. Contract: at most one
//! outstanding recognition per session (enforced by the serial audio-ingest
//! task); failures come back as empty text, which callers treat as
//! "no utterance".

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audio::{self, FrameDecoder};

#[async_trait]
pub trait Asr: Send + Sync {
    /// Recognize one complete utterance of encoded frames. Returns the text
    /// plus, when the provider keeps the audio around, the file it wrote.
    async fn transcribe(
        &self,
        frames: &[Vec<u8>],
        session_id: &str,
    ) -> Result<(String, Option<PathBuf>)>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpAsrConfig {
    /// Recognizer endpoint accepting `{"audio": <base64 wav>}`.
    #[serde(default = "default_asr_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    /// When set, the utterance WAV is kept under this directory.
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_asr_url() -> String {
    "http://127.0.0.1:9000/asr".to_string()
}

pub struct HttpAsr {
    client: Client,
    config: HttpAsrConfig,
}

#[derive(Deserialize)]
struct TranscriptionResult {
    #[serde(default)]
    text: String,
    #[serde(default)]
    error: Option<String>,
}

impl HttpAsr {
    pub fn new(block: serde_yaml::Value) -> Result<Self> {
        let config: HttpAsrConfig = if block.is_null() {
            serde_yaml::from_str("{}").expect("default ASR config")
        } else {
            serde_yaml::from_value(block).context("invalid HttpASR config")?
        };
        Ok(Self { client: Client::new(), config })
    }

    async fn recognize_wav(&self, audio_b64: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .timeout(Duration::from_secs(self.config.timeout))
            .json(&serde_json::json!({ "audio": audio_b64, "format": "wav" }))
            .send()
            .await
            .context("failed to reach ASR service")?;

        if !response.status().is_success() {
            anyhow::bail!("ASR service error: HTTP {}", response.status());
        }

        let result: TranscriptionResult =
            response.json().await.context("failed to parse ASR response")?;
        if let Some(error) = result.error.filter(|e| !e.is_empty()) {
            anyhow::bail!("ASR error: {}", error);
        }
        Ok(result.text.trim().to_string())
    }
}

#[async_trait]
impl Asr for HttpAsr {
    async fn transcribe(
        &self,
        frames: &[Vec<u8>],
        session_id: &str,
    ) -> Result<(String, Option<PathBuf>)> {
        let mut decoder = FrameDecoder::new()?;
        let mut pcm = Vec::with_capacity(frames.len() * audio::FRAME_SAMPLES);
        for frame in frames {
            match decoder.decode(frame) {
                Ok(samples) => pcm.extend_from_slice(&samples),
                Err(e) => debug!("skipping undecodable frame: {}", e),
            }
        }
        if pcm.is_empty() {
            return Ok((String::new(), None));
        }

        debug!(
            "Transcribing {} samples ({:.1}s of audio)",
            pcm.len(),
            pcm.len() as f64 / audio::SAMPLE_RATE as f64
        );
        let wav = audio::pcm_to_wav(&pcm, audio::SAMPLE_RATE)?;

        let file_path = match &self.config.output_dir {
            Some(dir) => {
                let dir = PathBuf::from(dir);
                std::fs::create_dir_all(&dir).context("failed to create ASR output dir")?;
                let path = dir.join(format!("asr_{}_{}.wav", session_id, uuid::Uuid::new_v4()));
                std::fs::write(&path, &wav).context("failed to write utterance WAV")?;
                Some(path)
            }
            None => None,
        };

        let audio_b64 = base64::engine::general_purpose::STANDARD.encode(&wav);

        // Two attempts: the first call after a cold start routinely fails.
        let mut last_err = None;
        for attempt in 0..2 {
            if attempt > 0 {
                info!("Retrying transcription (attempt {})", attempt + 1);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            match self.recognize_wav(&audio_b64).await {
                Ok(text) => {
                    info!("Recognized: \"{}\"", text);
                    return Ok((text, file_path));
                }
                Err(e) => {
                    warn!("Transcription attempt {} failed: {}", attempt + 1, e);
                    last_err = Some(e);
                }
            }
        }
        // Empty text, not an error: the pipeline resumes listening.
        warn!("ASR gave up: {}", last_err.map(|e| e.to_string()).unwrap_or_default());
        Ok((String::new(), file_path))
    }
}
