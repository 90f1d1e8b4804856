//! Ordered speech delivery
//!
//! Two tasks per session. The serializer consumes synthesis jobs in
//! submission order, enforcing the per-segment timeout, so segment i always
//! completes before i+1 is emitted. The emitter paces the resulting frames
//! onto the wire and owns the sentence_start/sentence_end/stop protocol.
//!
//! Frames are paced 20% faster than real time (60 ms → 48 ms) to stay ahead
//! of consumer buffering jitter; the shaved time is slept off after the last
//! frame so one segment still occupies its real duration.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info};

use crate::audio::FRAME_DURATION_MS;
use crate::server::session::{Outbound, SessionShared, TtsState};

const PACED_FRAME_MS: u64 = FRAME_DURATION_MS * 4 / 5;

/// A synthesis (or file-decode) job heading for the wire.
pub struct TtsJob {
    pub handle: JoinHandle<anyhow::Result<Vec<Vec<u8>>>>,
    pub text: String,
    pub index: i32,
}

/// Resolved audio ready for paced emission.
pub struct AudioItem {
    pub frames: Vec<Vec<u8>>,
    pub text: String,
    pub index: i32,
}

/// Resolve jobs in submission order. A job that times out or fails is
/// forwarded with no frames so the sentence protocol (and the final stop)
/// stays intact.
pub async fn run_tts_serializer(
    shared: Arc<SessionShared>,
    mut jobs: mpsc::Receiver<TtsJob>,
    audio_tx: mpsc::Sender<AudioItem>,
) {
    let tts_timeout = Duration::from_secs(shared.config.tts_timeout);
    while let Some(job) = jobs.recv().await {
        let frames = match timeout(tts_timeout, job.handle).await {
            Ok(Ok(Ok(frames))) => frames,
            Ok(Ok(Err(e))) => {
                error!("TTS failed for segment {}: {}", job.index, e);
                Vec::new()
            }
            Ok(Err(e)) => {
                error!("TTS task died for segment {}: {}", job.index, e);
                Vec::new()
            }
            Err(_) => {
                error!("TTS timeout for segment {} ({}s)", job.index, tts_timeout.as_secs());
                Vec::new()
            }
        };
        // Segments synthesized before an abort are dropped here; the emitter
        // re-checks for items already past this point.
        if shared.is_aborted() {
            debug!("dropping synthesized segment {} after abort", job.index);
            continue;
        }
        if audio_tx.send(AudioItem { frames, text: job.text, index: job.index }).await.is_err() {
            break;
        }
    }
}

/// Write serialized audio to the outbound channel with pacing and the
/// sentence protocol.
pub async fn run_audio_emitter(shared: Arc<SessionShared>, mut items: mpsc::Receiver<AudioItem>) {
    'items: while let Some(item) = items.recv().await {
        if shared.is_aborted() {
            debug!("abandoning segment {} after abort", item.index);
            continue;
        }

        if item.index == shared.first_segment_index() {
            info!("sending first reply segment: {}", item.text);
        }
        shared.send_tts_state(TtsState::SentenceStart, Some(item.text.clone())).await;

        let start = Instant::now();
        let mut play_position = Duration::ZERO;
        let total_frames = item.frames.len() as u64;
        for frame in item.frames {
            if shared.is_aborted() {
                continue 'items;
            }
            sleep_until(start + play_position).await;
            shared.send(Outbound::Audio(frame)).await;
            play_position += Duration::from_millis(PACED_FRAME_MS);
        }
        // Pay back the 20% pacing advance so wall time matches real duration.
        let compensation = total_frames * (FRAME_DURATION_MS - PACED_FRAME_MS);
        if compensation > 0 {
            sleep(Duration::from_millis(compensation)).await;
        }

        shared.send_tts_state(TtsState::SentenceEnd, Some(item.text)).await;

        if shared.llm_finished() && item.index == shared.last_segment_index() {
            shared.send_tts_state(TtsState::Stop, None).await;
            if shared.close_after_reply() {
                shared.request_close();
            }
        }
    }
}
