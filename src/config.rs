//! Configuration management
//!
//! Loads the YAML configuration file. Every key has a serde default so a
//! partial file (or none at all) still yields a runnable server. Provider
//! blocks are kept opaque here and handed to the selected provider untouched.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind address and handshake auth
    #[serde(default)]
    pub server: ServerConfig,
    /// Which provider implements each capability
    #[serde(default)]
    pub selected_module: SelectedModule,
    /// Per-provider config blocks, keyed by provider name, opaque to the core
    #[serde(rename = "VAD", default)]
    pub vad: HashMap<String, serde_yaml::Value>,
    #[serde(rename = "ASR", default)]
    pub asr: HashMap<String, serde_yaml::Value>,
    #[serde(rename = "LLM", default)]
    pub llm: HashMap<String, serde_yaml::Value>,
    #[serde(rename = "TTS", default)]
    pub tts: HashMap<String, serde_yaml::Value>,
    #[serde(rename = "Memory", default)]
    pub memory: HashMap<String, serde_yaml::Value>,
    #[serde(rename = "Intent", default)]
    pub intent: HashMap<String, serde_yaml::Value>,
    /// Initial system prompt
    #[serde(default = "default_prompt")]
    pub prompt: String,
    /// Welcome frame body sent on handshake accept
    #[serde(default = "default_welcome")]
    pub xiaozhi: serde_json::Value,
    /// Literal exit-command strings
    #[serde(rename = "CMD_exit", default = "default_cmd_exit")]
    pub cmd_exit: Vec<String>,
    /// Idle timeout in seconds before the session winds itself down
    #[serde(default = "default_no_voice_close")]
    pub close_connection_no_voice_time: u64,
    /// Hard timeout for one TTS synthesis, in seconds
    #[serde(default = "default_tts_timeout")]
    pub tts_timeout: u64,
    /// Whether synthesized audio files are removed after use
    #[serde(default = "default_true")]
    pub delete_audio: bool,
    #[serde(default)]
    pub music: MusicConfig,
    #[serde(default)]
    pub iot: IotConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub auth: AuthSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { ip: default_ip(), port: default_port(), auth: AuthSettings::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_devices: Vec<String>,
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub name: String,
}

/// Provider selection, one name per capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedModule {
    #[serde(rename = "VAD", default = "default_vad_module")]
    pub vad: String,
    #[serde(rename = "ASR", default = "default_asr_module")]
    pub asr: String,
    #[serde(rename = "LLM", default = "default_llm_module")]
    pub llm: String,
    #[serde(rename = "TTS", default = "default_tts_module")]
    pub tts: String,
    #[serde(rename = "Memory", default = "default_memory_module")]
    pub memory: String,
    #[serde(rename = "Intent", default = "default_intent_module")]
    pub intent: String,
}

impl Default for SelectedModule {
    fn default() -> Self {
        Self {
            vad: default_vad_module(),
            asr: default_asr_module(),
            llm: default_llm_module(),
            tts: default_tts_module(),
            memory: default_memory_module(),
            intent: default_intent_module(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicConfig {
    #[serde(default = "default_music_dir")]
    pub music_dir: String,
    #[serde(default = "default_music_ext")]
    pub music_ext: Vec<String>,
    /// Seconds between directory rescans
    #[serde(default = "default_music_refresh")]
    pub refresh_time: u64,
}

impl Default for MusicConfig {
    fn default() -> Self {
        Self {
            music_dir: default_music_dir(),
            music_ext: default_music_ext(),
            refresh_time: default_music_refresh(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IotConfig {
    #[serde(rename = "Speaker", default)]
    pub speaker: SpeakerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerConfig {
    #[serde(default = "default_speaker_volume")]
    pub volume: i64,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self { volume: default_speaker_volume() }
    }
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_prompt() -> String {
    "你是一个叫小智的语音助手，声音好听，习惯简短表达。\
     请像人一样说话，不要输出表情符号、代码或者xml标签。"
        .to_string()
}

fn default_welcome() -> serde_json::Value {
    serde_json::json!({
        "type": "hello",
        "transport": "websocket",
        "audio_params": {
            "format": "opus",
            "sample_rate": 16000,
            "channels": 1,
            "frame_duration": 60
        }
    })
}

fn default_cmd_exit() -> Vec<String> {
    vec!["退出".to_string(), "关闭".to_string()]
}

fn default_no_voice_close() -> u64 {
    120
}

fn default_tts_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_vad_module() -> String {
    "SileroVAD".to_string()
}

fn default_asr_module() -> String {
    "HttpASR".to_string()
}

fn default_llm_module() -> String {
    "OpenAILLM".to_string()
}

fn default_tts_module() -> String {
    "HttpTTS".to_string()
}

fn default_memory_module() -> String {
    "nomem".to_string()
}

fn default_intent_module() -> String {
    "function_call".to_string()
}

fn default_music_dir() -> String {
    "./music".to_string()
}

fn default_music_ext() -> Vec<String> {
    vec![".mp3".to_string(), ".wav".to_string(), ".p3".to_string()]
}

fn default_music_refresh() -> u64 {
    60
}

fn default_speaker_volume() -> i64 {
    100
}

impl Default for Config {
    fn default() -> Self {
        // An empty mapping picks up every serde default.
        serde_yaml::from_str("{}").expect("default config is well-formed")
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&raw).context("failed to parse config file")
    }

    /// Config block for the selected provider of a capability, if present.
    pub fn provider_block(
        blocks: &HashMap<String, serde_yaml::Value>,
        name: &str,
    ) -> serde_yaml::Value {
        blocks.get(name).cloned().unwrap_or(serde_yaml::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.close_connection_no_voice_time, 120);
        assert_eq!(config.tts_timeout, 10);
        assert!(config.delete_audio);
        assert_eq!(config.iot.speaker.volume, 100);
        assert_eq!(config.selected_module.vad, "SileroVAD");
        assert!(!config.server.auth.enabled);
    }

    #[test]
    fn parses_spec_keys() {
        let yaml = r#"
server:
  ip: 127.0.0.1
  port: 8765
  auth:
    enabled: true
    allowed_devices: ["dev-1"]
    tokens:
      - token: T1
        name: alice
selected_module:
  Intent: intent_llm
CMD_exit: ["退出"]
close_connection_no_voice_time: 60
music:
  music_dir: ./songs
  refresh_time: 30
iot:
  Speaker:
    volume: 80
LLM:
  OpenAILLM:
    api_url: http://localhost:11434/v1
    model_name: qwen2.5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 8765);
        assert!(config.server.auth.enabled);
        assert_eq!(config.server.auth.tokens[0].name, "alice");
        assert_eq!(config.selected_module.intent, "intent_llm");
        assert_eq!(config.cmd_exit, vec!["退出"]);
        assert_eq!(config.close_connection_no_voice_time, 60);
        assert_eq!(config.music.music_dir, "./songs");
        assert_eq!(config.iot.speaker.volume, 80);
        let block = Config::provider_block(&config.llm, "OpenAILLM");
        assert_eq!(block["model_name"].as_str(), Some("qwen2.5"));
    }
}
