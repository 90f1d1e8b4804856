//! Speech synthesis provider
//!
//! HTTP front for an OpenAI-style `/audio/speech` endpoint. The WAV reply is
//! re-encoded into wire-shaped Opus frames before the emitter ever sees it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::audio;

#[async_trait]
pub trait Tts: Send + Sync {
    /// Synthesize one segment into 60 ms Opus frames.
    async fn synthesize(&self, text: &str) -> Result<Vec<Vec<u8>>>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpTtsConfig {
    /// Synthesis endpoint, e.g. "http://localhost:3001/v1/audio/speech"
    #[serde(default = "default_tts_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Directory for keeping synthesized WAVs when `delete_audio` is off.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

fn default_voice() -> String {
    "zh-CN-XiaoxiaoNeural".to_string()
}

fn default_output_dir() -> String {
    "tmp".to_string()
}

fn default_tts_url() -> String {
    "http://127.0.0.1:8001/v1/audio/speech".to_string()
}

pub struct HttpTts {
    client: Client,
    config: HttpTtsConfig,
    delete_audio: bool,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

impl HttpTts {
    pub fn new(block: serde_yaml::Value, delete_audio: bool) -> Result<Self> {
        let config: HttpTtsConfig = if block.is_null() {
            serde_yaml::from_str("{}").expect("default TTS config")
        } else {
            serde_yaml::from_value(block).context("invalid HttpTTS config")?
        };
        Ok(Self { client: Client::new(), config, delete_audio })
    }
}

#[async_trait]
impl Tts for HttpTts {
    async fn synthesize(&self, text: &str) -> Result<Vec<Vec<u8>>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        debug!("TTS synthesizing: \"{}\"", text);

        let request = SpeechRequest {
            model: self.config.model.as_deref(),
            input: text,
            voice: &self.config.voice,
            response_format: "wav",
        };
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .context("failed to reach TTS service")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("TTS service error ({}): {}", status, body);
        }

        let wav = response.bytes().await.context("failed to read TTS response")?;

        if !self.delete_audio {
            let dir = PathBuf::from(&self.config.output_dir);
            std::fs::create_dir_all(&dir).context("failed to create TTS output dir")?;
            let path = dir.join(format!("tts_{}.wav", uuid::Uuid::new_v4()));
            std::fs::write(&path, &wav).context("failed to keep TTS WAV")?;
            debug!("kept synthesized audio at {}", path.display());
        }

        let frames = audio::wav_to_opus_frames(&wav)?;
        info!(
            "TTS produced {} frames ({:.1}s) for \"{}\"",
            frames.len(),
            frames.len() as f64 * audio::FRAME_DURATION_MS as f64 / 1000.0,
            text
        );
        Ok(frames)
    }
}
