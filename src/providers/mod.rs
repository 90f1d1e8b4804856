//! Pluggable capability providers
//!
//! Each capability (VAD/ASR/LLM/TTS/Memory/Intent) is a trait; concrete
//! implementations are registered by name and selected through
//! `selected_module` in the config. The registry is explicit and populated
//! here at bootstrap; there is no dynamic loading.

pub mod asr;
pub mod intent;
pub mod llm;
pub mod memory;
pub mod tts;
pub mod vad;

use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
pub use asr::{Asr, HttpAsr};
pub use intent::LlmIntent;
pub use llm::{Llm, OpenAiLlm};
pub use memory::{FileLockManager, Memory, NoMemory, YamlMemory};
pub use tts::{HttpTts, Tts};
pub use vad::{SileroVad, Vad, VadSession};

/// The providers one session runs with.
pub struct ProviderSet {
    pub vad: Arc<dyn Vad>,
    pub asr: Arc<dyn Asr>,
    pub llm: Arc<dyn Llm>,
    pub tts: Arc<dyn Tts>,
    pub memory: Arc<dyn Memory>,
    /// Present only in classifier mode.
    pub intent: Option<LlmIntent>,
    /// Shortcut mode: skip the classifier, hand the LLM the tool schemas.
    pub function_call_mode: bool,
}

/// Build the provider set selected by the config. Fails fast on unknown
/// provider names so a typo surfaces at startup, not mid-conversation.
pub async fn build(config: &Config, locks: Arc<FileLockManager>) -> Result<ProviderSet> {
    let selected = &config.selected_module;
    info!(
        "selected modules: VAD={} ASR={} LLM={} TTS={} Memory={} Intent={}",
        selected.vad, selected.asr, selected.llm, selected.tts, selected.memory, selected.intent
    );

    let vad: Arc<dyn Vad> = match selected.vad.as_str() {
        "SileroVAD" => {
            Arc::new(SileroVad::load(Config::provider_block(&config.vad, &selected.vad)).await?)
        }
        name => bail!("unknown VAD provider: {}", name),
    };

    let asr: Arc<dyn Asr> = match selected.asr.as_str() {
        "HttpASR" => Arc::new(HttpAsr::new(Config::provider_block(&config.asr, &selected.asr))?),
        name => bail!("unknown ASR provider: {}", name),
    };

    let llm: Arc<dyn Llm> = match selected.llm.as_str() {
        "OpenAILLM" => {
            Arc::new(OpenAiLlm::new(Config::provider_block(&config.llm, &selected.llm))?)
        }
        name => bail!("unknown LLM provider: {}", name),
    };

    let tts: Arc<dyn Tts> = match selected.tts.as_str() {
        "HttpTTS" => Arc::new(HttpTts::new(
            Config::provider_block(&config.tts, &selected.tts),
            config.delete_audio,
        )?),
        name => bail!("unknown TTS provider: {}", name),
    };

    let memory: Arc<dyn Memory> = match selected.memory.as_str() {
        "nomem" => Arc::new(NoMemory),
        "mem_local_short" => Arc::new(YamlMemory::new(
            Config::provider_block(&config.memory, &selected.memory),
            llm.clone(),
            locks,
        )?),
        name => bail!("unknown Memory provider: {}", name),
    };

    let (intent, function_call_mode) = match selected.intent.as_str() {
        // Shortcut mode: the LLM sees the tool schemas directly.
        "function_call" | "nointent" => (None, selected.intent == "function_call"),
        "intent_llm" => (Some(LlmIntent::new(llm.clone())), false),
        name => bail!("unknown Intent provider: {}", name),
    };

    Ok(ProviderSet { vad, asr, llm, tts, memory, intent, function_call_mode })
}
