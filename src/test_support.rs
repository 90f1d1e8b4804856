//! Test doubles for exercising the pipeline without network, models or audio
//! hardware. Used by in-crate unit tests and the integration suite.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::dialogue::Turn;
use crate::music::MusicLibrary;
use crate::providers::llm::{ChatMessage, Llm, LlmEvent, ToolDefinition};
use crate::providers::{Asr, Memory, ProviderSet, Tts, Vad, VadSession};
use crate::server::emitter;
use crate::server::session::{Outbound, SessionShared};
use crate::tools::ToolRegistry;

/// VAD returning a constant probability.
pub struct ConstantVad {
    pub prob: f32,
    pub threshold: f32,
    pub min_silence_ms: u64,
}

impl Default for ConstantVad {
    fn default() -> Self {
        Self { prob: 0.0, threshold: 0.5, min_silence_ms: 100 }
    }
}

struct ConstantVadSession {
    prob: f32,
}

impl VadSession for ConstantVadSession {
    fn speech_probability(&mut self, _window: &[f32]) -> Result<f32> {
        Ok(self.prob)
    }

    fn reset(&mut self) {}
}

impl Vad for ConstantVad {
    fn new_session(&self) -> Result<Box<dyn VadSession>> {
        Ok(Box::new(ConstantVadSession { prob: self.prob }))
    }

    fn threshold(&self) -> f32 {
        self.threshold
    }

    fn min_silence_ms(&self) -> u64 {
        self.min_silence_ms
    }
}

/// ASR returning a fixed transcription.
pub struct FakeAsr {
    pub text: String,
    pub calls: AtomicUsize,
}

impl FakeAsr {
    pub fn new(text: &str) -> Self {
        Self { text: text.to_string(), calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl Asr for FakeAsr {
    async fn transcribe(
        &self,
        _frames: &[Vec<u8>],
        _session_id: &str,
    ) -> Result<(String, Option<std::path::PathBuf>)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.text.clone(), None))
    }
}

/// LLM replaying scripted event sequences, one script per `chat_stream` call.
pub struct ScriptedLlm {
    scripts: Mutex<VecDeque<Vec<LlmEvent>>>,
    pub stream_calls: AtomicUsize,
    pub once_reply: String,
}

impl ScriptedLlm {
    pub fn new(scripts: Vec<Vec<LlmEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            stream_calls: AtomicUsize::new(0),
            once_reply: String::new(),
        }
    }

    pub fn with_once_reply(mut self, reply: &str) -> Self {
        self.once_reply = reply.to_string();
        self
    }

    /// Content-delta script from plain strings.
    pub fn content_script(deltas: &[&str]) -> Vec<LlmEvent> {
        deltas.iter().map(|d| LlmEvent::Content(d.to_string())).collect()
    }
}

#[async_trait]
impl Llm for ScriptedLlm {
    async fn chat_stream(
        &self,
        _session_id: &str,
        _messages: Vec<ChatMessage>,
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<mpsc::Receiver<LlmEvent>> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for event in script {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn chat_once(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String> {
        Ok(self.once_reply.clone())
    }
}

/// TTS producing a fixed number of tiny frames per segment.
pub struct FakeTts {
    pub frames_per_segment: usize,
    pub calls: AtomicUsize,
}

impl FakeTts {
    pub fn new(frames_per_segment: usize) -> Self {
        Self { frames_per_segment, calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl Tts for FakeTts {
    async fn synthesize(&self, _text: &str) -> Result<Vec<Vec<u8>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![vec![0u8; 8]; self.frames_per_segment])
    }
}

/// Memory recording saves in-process.
#[derive(Default)]
pub struct RecordingMemory {
    pub saved: Mutex<Vec<(String, usize)>>,
}

#[async_trait]
impl Memory for RecordingMemory {
    async fn save(&self, device_id: &str, transcript: &[Turn]) -> Result<()> {
        self.saved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((device_id.to_string(), transcript.len()));
        Ok(())
    }

    async fn query(&self, _device_id: &str, _query: &str) -> Result<String> {
        Ok(String::new())
    }
}

/// Provider set wired entirely with fakes.
pub fn fake_providers(llm: Arc<dyn Llm>, function_call_mode: bool) -> Arc<ProviderSet> {
    Arc::new(ProviderSet {
        vad: Arc::new(ConstantVad::default()),
        asr: Arc::new(FakeAsr::new("")),
        llm,
        tts: Arc::new(FakeTts::new(2)),
        memory: Arc::new(RecordingMemory::default()),
        intent: None,
        function_call_mode,
    })
}

/// A session wired to in-memory channels, with the serializer and emitter
/// tasks running. The outbound receiver observes every frame in wire order.
pub struct Harness {
    pub shared: Arc<SessionShared>,
    pub outbound: mpsc::Receiver<Outbound>,
}

pub fn harness(config: Config, providers: Arc<ProviderSet>) -> Harness {
    let (out_tx, out_rx) = mpsc::channel(256);
    let (tts_tx, tts_rx) = mpsc::channel(64);
    let (audio_tx, audio_rx) = mpsc::channel(64);

    let config = Arc::new(config);
    let music = Arc::new(MusicLibrary::new(&config.music));
    let shared = SessionShared::new(
        config,
        providers,
        music,
        Arc::new(ToolRegistry::with_builtins()),
        Some("dev-test".to_string()),
        out_tx,
        tts_tx,
    );
    tokio::spawn(emitter::run_tts_serializer(shared.clone(), tts_rx, audio_tx));
    tokio::spawn(emitter::run_audio_emitter(shared.clone(), audio_rx));
    Harness { shared, outbound: out_rx }
}

/// A bare shared session with no background tasks, for state-machine tests.
pub fn make_shared_default() -> Arc<SessionShared> {
    let (out_tx, _out_rx) = mpsc::channel(16);
    let (tts_tx, _tts_rx) = mpsc::channel(16);
    SessionShared::new(
        Arc::new(Config::default()),
        fake_providers(Arc::new(ScriptedLlm::new(Vec::new())), true),
        Arc::new(MusicLibrary::new(&crate::config::MusicConfig::default())),
        Arc::new(ToolRegistry::with_builtins()),
        Some("dev-test".to_string()),
        out_tx,
        tts_tx,
    )
}
