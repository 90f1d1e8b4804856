//! VAD gate and utterance segmentation
//!
//! Runs as a dedicated per-session worker so Opus decode and model inference
//! never stall the inbound reader. In auto mode each frame is decoded to PCM
//! and evaluated in 512-sample windows; in manual mode the device asserts
//! speech boundaries through `listen` control frames and the gate only gates
//! ingest on those flags.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audio::{FrameDecoder, VAD_WINDOW_SAMPLES};
use crate::providers::VadSession;
use crate::server::dispatch;
use crate::server::session::{IngestEvent, ListenMode, SessionShared};
use crate::utils::remove_punctuation_and_length;

/// Silent frames kept as pre-roll so a new utterance keeps its first syllable.
const PRE_ROLL_FRAMES: usize = 5;
/// Utterances shorter than this are discarded as noise.
const MIN_UTTERANCE_FRAMES: usize = 10;

/// Prompt injected as a user turn when the idle timeout fires.
const VALEDICTION_PROMPT: &str =
    "请你以'时间过得真快'为开头，用富有感情、依依不舍的话来结束这场对话吧。";

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Speech/silence decision state for one session.
pub struct VadGate {
    vad: Box<dyn VadSession>,
    decoder: FrameDecoder,
    threshold: f32,
    min_silence_ms: u64,
    pcm_buffer: Vec<i16>,
}

impl VadGate {
    pub fn new(
        vad: Box<dyn VadSession>,
        threshold: f32,
        min_silence_ms: u64,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            vad,
            decoder: FrameDecoder::new()?,
            threshold,
            min_silence_ms,
            pcm_buffer: Vec::new(),
        })
    }

    /// Decode one inbound frame and evaluate any complete windows.
    /// Returns whether the newest evaluated window contained speech.
    pub fn process_frame(&mut self, shared: &SessionShared, frame: &[u8]) -> bool {
        match self.decoder.decode(frame) {
            Ok(pcm) => self.process_pcm(shared, &pcm, now_ms()),
            Err(e) => {
                debug!("frame decode error: {}", e);
                false
            }
        }
    }

    /// Window evaluation over raw PCM, with an injectable clock.
    pub fn process_pcm(&mut self, shared: &SessionShared, pcm: &[i16], now_ms: u64) -> bool {
        self.pcm_buffer.extend_from_slice(pcm);

        let mut have_voice = false;
        while self.pcm_buffer.len() >= VAD_WINDOW_SAMPLES {
            let window: Vec<f32> = self
                .pcm_buffer
                .drain(..VAD_WINDOW_SAMPLES)
                .map(|s| s as f32 / 32768.0)
                .collect();
            let prob = match self.vad.speech_probability(&window) {
                Ok(p) => p,
                Err(e) => {
                    warn!("VAD inference error: {}", e);
                    continue;
                }
            };
            have_voice = prob >= self.threshold;

            // End-of-speech: silence for at least min_silence after the last
            // speech window, and only once speech has been seen at all.
            if shared.client_have_voice() && !have_voice {
                let silence = now_ms.saturating_sub(shared.have_voice_last_ms());
                if silence >= self.min_silence_ms {
                    shared.set_client_voice_stop(true);
                }
            }
            if have_voice {
                shared.touch_have_voice(now_ms);
            }
        }
        have_voice
    }

    pub fn reset(&mut self) {
        self.vad.reset();
        self.pcm_buffer.clear();
    }
}

/// The per-session audio worker: gates ingest, accumulates the utterance,
/// invokes recognition on end-of-speech, and watches the idle timeout.
pub async fn run_audio_ingest(
    shared: Arc<SessionShared>,
    mut rx: mpsc::Receiver<IngestEvent>,
    vad: Box<dyn VadSession>,
) {
    let mut gate = match VadGate::new(
        vad,
        shared.providers.vad.threshold(),
        shared.providers.vad.min_silence_ms(),
    ) {
        Ok(gate) => gate,
        Err(e) => {
            warn!("audio ingest unavailable: {}", e);
            return;
        }
    };
    let mut utterance: Vec<Vec<u8>> = Vec::new();
    let mut no_voice_since: Option<Instant> = None;

    while let Some(event) = rx.recv().await {
        let frame = match event {
            IngestEvent::Frame(frame) => frame,
            IngestEvent::Clear => {
                utterance.clear();
                continue;
            }
        };

        if !shared.asr_ingest_enabled() {
            // A reply is in flight; frames are dropped until it finishes.
            continue;
        }

        let have_voice = match shared.listen_mode() {
            ListenMode::Auto => gate.process_frame(&shared, &frame),
            ListenMode::Manual => shared.client_have_voice(),
        };

        if !have_voice && !shared.client_have_voice() {
            check_idle_timeout(&shared, &mut no_voice_since).await;
            // Trailing silent ring: pre-roll for the next utterance.
            utterance.push(frame);
            let overflow = utterance.len().saturating_sub(PRE_ROLL_FRAMES);
            if overflow > 0 {
                utterance.drain(..overflow);
            }
            continue;
        }

        no_voice_since = None;
        utterance.push(frame);

        if shared.client_voice_stop() {
            shared.set_abort(false);
            shared.set_asr_ingest(false);

            if utterance.len() < MIN_UTTERANCE_FRAMES {
                debug!("utterance too short ({} frames), discarding", utterance.len());
                shared.set_asr_ingest(true);
            } else {
                let (text, _file) = match shared
                    .providers
                    .asr
                    .transcribe(&utterance, &shared.session_id)
                    .await
                {
                    Ok(result) => result,
                    Err(e) => {
                        warn!("recognition failed: {}", e);
                        (String::new(), None)
                    }
                };
                info!("recognized text: {}", text);
                let (length, _) = remove_punctuation_and_length(&text);
                if length > 0 {
                    dispatch::start_to_chat(&shared, &text).await;
                } else {
                    shared.set_asr_ingest(true);
                }
            }

            utterance.clear();
            gate.reset();
            shared.reset_vad_states();
        }
    }
}

/// After a configured stretch of silence the session says goodbye on its own:
/// a valedictory user prompt goes through the normal dispatch path and the
/// reply closes the connection.
async fn check_idle_timeout(shared: &Arc<SessionShared>, no_voice_since: &mut Option<Instant>) {
    let Some(since) = *no_voice_since else {
        *no_voice_since = Some(Instant::now());
        return;
    };
    let idle = Duration::from_secs(shared.config.close_connection_no_voice_time);
    if !shared.close_after_reply() && since.elapsed() > idle {
        info!("idle for {}s, winding the session down", idle.as_secs());
        shared.set_close_after_reply(true);
        shared.set_abort(false);
        shared.set_asr_ingest(false);
        dispatch::start_to_chat(shared, VALEDICTION_PROMPT).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::vad::VadSession;

    /// Scripted probabilities, one per window.
    struct ScriptedVad {
        probs: Vec<f32>,
        pos: usize,
    }

    impl VadSession for ScriptedVad {
        fn speech_probability(&mut self, _window: &[f32]) -> anyhow::Result<f32> {
            let p = self.probs.get(self.pos).copied().unwrap_or(0.0);
            self.pos += 1;
            Ok(p)
        }

        fn reset(&mut self) {}
    }

    fn gate_with(probs: Vec<f32>) -> VadGate {
        VadGate::new(Box::new(ScriptedVad { probs, pos: 0 }), 0.5, 100).unwrap()
    }

    fn test_shared() -> Arc<SessionShared> {
        crate::test_support::make_shared_default()
    }

    const WINDOW: usize = VAD_WINDOW_SAMPLES;

    #[test]
    fn speech_sets_have_voice_and_timestamp() {
        let shared = test_shared();
        let mut gate = gate_with(vec![0.9, 0.9]);
        let pcm = vec![0i16; WINDOW * 2];
        assert!(gate.process_pcm(&shared, &pcm, 1_000));
        assert!(shared.client_have_voice());
        assert_eq!(shared.have_voice_last_ms(), 1_000);
        assert!(!shared.client_voice_stop());
    }

    #[test]
    fn voice_stop_needs_min_silence_after_speech() {
        let shared = test_shared();
        let mut gate = gate_with(vec![0.9, 0.1, 0.1, 0.1]);
        let window = vec![0i16; WINDOW];

        gate.process_pcm(&shared, &window, 1_000); // speech
        gate.process_pcm(&shared, &window, 1_050); // silence, only 50ms
        assert!(!shared.client_voice_stop());
        gate.process_pcm(&shared, &window, 1_099); // still below 100ms
        assert!(!shared.client_voice_stop());
        gate.process_pcm(&shared, &window, 1_100); // 100ms reached
        assert!(shared.client_voice_stop());
    }

    #[test]
    fn silence_alone_never_stops_voice() {
        let shared = test_shared();
        let mut gate = gate_with(vec![0.0, 0.0, 0.0]);
        let pcm = vec![0i16; WINDOW * 3];
        assert!(!gate.process_pcm(&shared, &pcm, 5_000));
        assert!(!shared.client_have_voice());
        assert!(!shared.client_voice_stop());
    }

    #[test]
    fn have_voice_last_time_is_monotonic() {
        let shared = test_shared();
        let mut gate = gate_with(vec![0.9, 0.9, 0.9]);
        let window = vec![0i16; WINDOW];
        gate.process_pcm(&shared, &window, 2_000);
        assert_eq!(shared.have_voice_last_ms(), 2_000);
        // A clock hiccup must not move the watermark backwards.
        gate.process_pcm(&shared, &window, 1_500);
        assert_eq!(shared.have_voice_last_ms(), 2_000);
        gate.process_pcm(&shared, &window, 2_500);
        assert_eq!(shared.have_voice_last_ms(), 2_500);
    }
}
