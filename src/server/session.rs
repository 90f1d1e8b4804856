//! Per-connection session
//!
//! Owns everything one device conversation needs: the inbound router, the
//! outbound sender, the audio-ingest worker, the TTS serializer and the audio
//! emitter, plus the shared flags every stage consults. All frame writing
//! funnels through one mpsc channel so the socket has a single writer.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dialogue::Dialogue;
use crate::music::MusicLibrary;
use crate::providers::ProviderSet;
use crate::server::dispatch;
use crate::server::emitter::{self, TtsJob};
use crate::server::iot::{DescriptorSpec, IotCommand, IotRegistry, StateUpdate};
use crate::server::vad_gate;
use crate::tools::ToolRegistry;
use crate::utils::strip_punctuation_and_emoji;

/// Cap on concurrent short-lived worker tasks (TTS synthesis etc.) per session.
const WORKER_CAP: usize = 10;

/// Everything written to the socket.
pub enum Outbound {
    /// Pre-serialized JSON (welcome frame, raw echo).
    Text(String),
    /// Typed control frame.
    Frame(ServerFrame),
    /// One encoded audio frame.
    Audio(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    SentenceEnd,
    Stop,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "stt")]
    Stt { text: String, session_id: String },
    #[serde(rename = "llm")]
    Llm { text: String, emotion: String, session_id: String },
    #[serde(rename = "tts")]
    Tts {
        state: TtsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        session_id: String,
    },
    #[serde(rename = "iot")]
    Iot { commands: Vec<IotCommand> },
}

/// Event for the audio-ingest worker.
pub enum IngestEvent {
    Frame(Vec<u8>),
    /// Drop the current utterance buffer (listen `detect`).
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    Auto,
    Manual,
}

/// Shared per-session state, one Arc held by every stage.
pub struct SessionShared {
    pub session_id: String,
    pub device_id: Option<String>,
    pub config: Arc<Config>,
    pub providers: Arc<ProviderSet>,
    pub music: Arc<MusicLibrary>,
    pub tools: Arc<ToolRegistry>,
    pub welcome: serde_json::Value,
    /// Transcript, appended only by the dispatcher.
    pub transcript: Mutex<Dialogue>,
    /// Capability registry, mutated only by the inbound-frame reader.
    pub iot: RwLock<IotRegistry>,

    outbound: mpsc::Sender<Outbound>,
    tts_jobs: mpsc::Sender<TtsJob>,
    worker_permits: Arc<Semaphore>,

    abort: AtomicBool,
    close_after_reply: AtomicBool,
    llm_finished: AtomicBool,
    /// True while the ingest worker accepts audio frames.
    asr_ingest: AtomicBool,
    listen_auto: AtomicBool,
    client_have_voice: AtomicBool,
    client_voice_stop: AtomicBool,
    have_voice_last_ms: AtomicU64,
    tts_first_index: AtomicI32,
    tts_last_index: AtomicI32,

    closing: AtomicBool,
    shutdown: Notify,
}

impl SessionShared {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        providers: Arc<ProviderSet>,
        music: Arc<MusicLibrary>,
        tools: Arc<ToolRegistry>,
        device_id: Option<String>,
        outbound: mpsc::Sender<Outbound>,
        tts_jobs: mpsc::Sender<TtsJob>,
    ) -> Arc<Self> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut welcome = config.xiaozhi.clone();
        if let Some(obj) = welcome.as_object_mut() {
            obj.insert("session_id".to_string(), serde_json::json!(session_id));
        }
        let prompt = config.prompt.clone();
        Arc::new(Self {
            session_id,
            device_id,
            config,
            providers,
            music,
            tools,
            welcome,
            transcript: Mutex::new(Dialogue::new(&prompt)),
            iot: RwLock::new(IotRegistry::default()),
            outbound,
            tts_jobs,
            worker_permits: Arc::new(Semaphore::new(WORKER_CAP)),
            abort: AtomicBool::new(false),
            close_after_reply: AtomicBool::new(false),
            llm_finished: AtomicBool::new(false),
            asr_ingest: AtomicBool::new(true),
            listen_auto: AtomicBool::new(true),
            client_have_voice: AtomicBool::new(false),
            client_voice_stop: AtomicBool::new(false),
            have_voice_last_ms: AtomicU64::new(0),
            tts_first_index: AtomicI32::new(-1),
            tts_last_index: AtomicI32::new(-1),
            closing: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    // ── outbound ─────────────────────────────────────────────

    pub async fn send(&self, outbound: Outbound) {
        let _ = self.outbound.send(outbound).await;
    }

    pub async fn send_frame(&self, frame: ServerFrame) {
        self.send(Outbound::Frame(frame)).await;
    }

    pub async fn send_tts_state(&self, state: TtsState, text: Option<String>) {
        self.send_frame(ServerFrame::Tts {
            state,
            text,
            session_id: self.session_id.clone(),
        })
        .await;
        if state == TtsState::Stop {
            self.clear_speak_status();
        }
    }

    /// Echo a recognition result, cue the client UI, and open the reply.
    pub async fn send_stt_flow(&self, text: &str) {
        self.send_frame(ServerFrame::Stt {
            text: strip_punctuation_and_emoji(text).to_string(),
            session_id: self.session_id.clone(),
        })
        .await;
        self.send_frame(ServerFrame::Llm {
            text: "😊".to_string(),
            emotion: "happy".to_string(),
            session_id: self.session_id.clone(),
        })
        .await;
        self.send_tts_state(TtsState::Start, None).await;
    }

    // ── flags ────────────────────────────────────────────────

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn set_abort(&self, value: bool) {
        self.abort.store(value, Ordering::SeqCst);
    }

    pub fn llm_finished(&self) -> bool {
        self.llm_finished.load(Ordering::SeqCst)
    }

    pub fn set_llm_finished(&self, value: bool) {
        self.llm_finished.store(value, Ordering::SeqCst);
    }

    pub fn close_after_reply(&self) -> bool {
        self.close_after_reply.load(Ordering::SeqCst)
    }

    pub fn set_close_after_reply(&self, value: bool) {
        self.close_after_reply.store(value, Ordering::SeqCst);
    }

    pub fn asr_ingest_enabled(&self) -> bool {
        self.asr_ingest.load(Ordering::SeqCst)
    }

    pub fn set_asr_ingest(&self, value: bool) {
        self.asr_ingest.store(value, Ordering::SeqCst);
    }

    pub fn listen_mode(&self) -> ListenMode {
        if self.listen_auto.load(Ordering::SeqCst) {
            ListenMode::Auto
        } else {
            ListenMode::Manual
        }
    }

    pub fn set_listen_mode(&self, mode: ListenMode) {
        self.listen_auto.store(mode == ListenMode::Auto, Ordering::SeqCst);
    }

    pub fn client_have_voice(&self) -> bool {
        self.client_have_voice.load(Ordering::SeqCst)
    }

    pub fn set_client_have_voice(&self, value: bool) {
        self.client_have_voice.store(value, Ordering::SeqCst);
    }

    pub fn client_voice_stop(&self) -> bool {
        self.client_voice_stop.load(Ordering::SeqCst)
    }

    pub fn set_client_voice_stop(&self, value: bool) {
        self.client_voice_stop.store(value, Ordering::SeqCst);
    }

    pub fn have_voice_last_ms(&self) -> u64 {
        self.have_voice_last_ms.load(Ordering::SeqCst)
    }

    /// Monotonic: only moves forward.
    pub fn touch_have_voice(&self, now_ms: u64) {
        self.have_voice_last_ms.fetch_max(now_ms, Ordering::SeqCst);
        self.set_client_have_voice(true);
    }

    pub fn reset_vad_states(&self) {
        self.set_client_have_voice(false);
        self.set_client_voice_stop(false);
        self.have_voice_last_ms.store(0, Ordering::SeqCst);
        debug!("VAD states reset");
    }

    // ── reply bookkeeping ────────────────────────────────────

    pub fn first_segment_index(&self) -> i32 {
        self.tts_first_index.load(Ordering::SeqCst)
    }

    pub fn last_segment_index(&self) -> i32 {
        self.tts_last_index.load(Ordering::SeqCst)
    }

    /// Track the first and last spoken segment of the current reply.
    pub fn record_segment_index(&self, index: i32) {
        let _ = self.tts_first_index.compare_exchange(
            -1,
            index,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.tts_last_index.store(index, Ordering::SeqCst);
    }

    /// Reset speaking state: re-enable ingest, forget segment indices.
    pub fn clear_speak_status(&self) {
        self.set_asr_ingest(true);
        self.tts_first_index.store(-1, Ordering::SeqCst);
        self.tts_last_index.store(-1, Ordering::SeqCst);
    }

    /// Spawn synthesis for one segment and queue it in submission order.
    pub fn submit_tts(&self, text: String, index: i32) {
        let tts = self.providers.tts.clone();
        let permits = self.worker_permits.clone();
        let synth_text = text.clone();
        let handle = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await;
            tts.synthesize(&synth_text).await
        });
        self.submit_audio_job(handle, text, index);
    }

    /// Queue an arbitrary frame-producing job (music playback, farewell).
    pub fn submit_audio_job(
        &self,
        handle: tokio::task::JoinHandle<anyhow::Result<Vec<Vec<u8>>>>,
        text: String,
        index: i32,
    ) {
        if self.tts_jobs.try_send(TtsJob { handle, text, index }).is_err() {
            warn!("TTS queue full or closed, dropping segment {}", index);
        }
    }

    // ── lifecycle ────────────────────────────────────────────

    pub fn request_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub async fn closed(&self) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        self.shutdown.notified().await;
    }

    /// Peer abort: stop the current reply, acknowledge with one stop frame.
    pub async fn handle_abort(&self) {
        info!("abort received, cancelling current reply");
        self.set_abort(true);
        self.send_tts_state(TtsState::Stop, None).await;
    }
}

// ─── Connection handling ─────────────────────────────────────

/// Run one accepted connection to completion.
pub async fn handle_session(
    ws: WebSocket,
    config: Arc<Config>,
    providers: Arc<ProviderSet>,
    music: Arc<MusicLibrary>,
    tools: Arc<ToolRegistry>,
    device_id: Option<String>,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (out_tx, out_rx) = mpsc::channel::<Outbound>(64);
    let sender_task = tokio::spawn(run_sender(ws_tx, out_rx));

    let (tts_tx, tts_rx) = mpsc::channel(64);
    let (audio_tx, audio_rx) = mpsc::channel(64);
    let (ingest_tx, ingest_rx) = mpsc::channel::<IngestEvent>(256);

    let shared =
        SessionShared::new(config, providers, music, tools, device_id, out_tx, tts_tx);
    info!("session {} connected (device: {:?})", shared.session_id, shared.device_id);

    shared.send(Outbound::Text(shared.welcome.to_string())).await;

    let vad_session = match shared.providers.vad.new_session() {
        Ok(session) => session,
        Err(e) => {
            warn!("failed to initialize VAD for session {}: {}", shared.session_id, e);
            shared.request_close();
            sender_task.abort();
            return;
        }
    };

    let serializer =
        tokio::spawn(emitter::run_tts_serializer(shared.clone(), tts_rx, audio_tx));
    let audio_emitter = tokio::spawn(emitter::run_audio_emitter(shared.clone(), audio_rx));
    let ingest =
        tokio::spawn(vad_gate::run_audio_ingest(shared.clone(), ingest_rx, vad_session));

    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_text_frame(&shared, &ingest_tx, text.as_str()).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    // Backpressure on the bounded channel is the only wait here.
                    if ingest_tx.send(IngestEvent::Frame(data.to_vec())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("session {} peer closed", shared.session_id);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("session {} socket error: {}", shared.session_id, e);
                    break;
                }
            },
            _ = shared.closed() => {
                info!("session {} closing", shared.session_id);
                break;
            }
        }
    }

    // Teardown: cancel in-flight work, persist memory, close the outbound side.
    shared.set_abort(true);
    shared.request_close();
    drop(ingest_tx);

    if let Some(device_id) = shared.device_id.clone() {
        let transcript = shared.transcript.lock().await;
        if let Err(e) = shared.providers.memory.save(&device_id, transcript.turns()).await {
            warn!("memory save failed for session {}: {}", shared.session_id, e);
        }
    }

    ingest.abort();
    serializer.abort();
    audio_emitter.abort();
    sender_task.abort();
    info!("session {} resources released", shared.session_id);
}

async fn run_sender(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        let result = match outbound {
            Outbound::Text(text) => ws_tx.send(Message::Text(text.into())).await,
            Outbound::Frame(frame) => {
                let json = serde_json::to_string(&frame).unwrap_or_default();
                ws_tx.send(Message::Text(json.into())).await
            }
            Outbound::Audio(data) => ws_tx.send(Message::Binary(data.into())).await,
        };
        if result.is_err() {
            break;
        }
    }
}

/// Dispatch one inbound text frame by its `type` field. Malformed JSON and
/// bare numbers are echoed back as a debugging aid.
pub async fn handle_text_frame(
    shared: &Arc<SessionShared>,
    ingest_tx: &mpsc::Sender<IngestEvent>,
    raw: &str,
) {
    debug!("text frame: {}", raw);
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        shared.send(Outbound::Text(raw.to_string())).await;
        return;
    };
    if value.is_number() {
        shared.send(Outbound::Text(raw.to_string())).await;
        return;
    }

    match value.get("type").and_then(|t| t.as_str()) {
        Some("hello") => {
            shared.send(Outbound::Text(shared.welcome.to_string())).await;
        }
        Some("abort") => {
            shared.handle_abort().await;
        }
        Some("listen") => {
            if let Some(mode) = value.get("mode").and_then(|m| m.as_str()) {
                let mode = if mode == "manual" { ListenMode::Manual } else { ListenMode::Auto };
                shared.set_listen_mode(mode);
                debug!("listen mode: {:?}", mode);
            }
            match value.get("state").and_then(|s| s.as_str()) {
                Some("start") => {
                    shared.set_client_have_voice(true);
                    shared.set_client_voice_stop(false);
                }
                Some("stop") => {
                    shared.set_client_have_voice(true);
                    shared.set_client_voice_stop(true);
                }
                Some("detect") => {
                    shared.set_asr_ingest(false);
                    shared.set_client_have_voice(false);
                    let _ = ingest_tx.send(IngestEvent::Clear).await;
                    if let Some(text) = value.get("text").and_then(|t| t.as_str()) {
                        dispatch::start_to_chat(shared, text).await;
                    }
                }
                _ => {}
            }
        }
        Some("iot") => {
            if let Some(descriptors) = value.get("descriptors") {
                match serde_json::from_value::<Vec<DescriptorSpec>>(descriptors.clone()) {
                    Ok(specs) => handle_iot_descriptors(shared, specs).await,
                    Err(e) => warn!("bad iot descriptors: {}", e),
                }
            }
            if let Some(states) = value.get("states") {
                match serde_json::from_value::<Vec<StateUpdate>>(states.clone()) {
                    Ok(updates) => shared.iot.write().await.apply_states(updates),
                    Err(e) => warn!("bad iot states: {}", e),
                }
            }
        }
        _ => {
            shared.send(Outbound::Text(raw.to_string())).await;
        }
    }
}

/// Register capabilities and push the configured default volume to a Speaker
/// capability when one was declared.
pub async fn handle_iot_descriptors(shared: &Arc<SessionShared>, specs: Vec<DescriptorSpec>) {
    let command = {
        let mut registry = shared.iot.write().await;
        registry.register(specs);
        if registry.has_capability("Speaker") {
            let volume = shared.config.iot.speaker.volume;
            registry.build_command("Speaker", "SetVolume", serde_json::json!({ "volume": volume }))
        } else {
            None
        }
    };
    if let Some(command) = command {
        info!("setting default speaker volume");
        shared.send_frame(ServerFrame::Iot { commands: vec![command] }).await;
    }
}
