//! End-to-end pipeline tests over the session dispatcher with fake providers.
//! No network, no models: scripted LLM streams, constant-probability VAD and
//! a frame-stamping TTS drive the real dispatcher, serializer and emitter.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use xiaozhi_server::providers::llm::LlmEvent;
use xiaozhi_server::server::dispatch;
use xiaozhi_server::server::session::{handle_iot_descriptors, Outbound};
use xiaozhi_server::test_support::{fake_providers, harness, Harness, ScriptedLlm};
use xiaozhi_server::{Config, Role};

/// A decoded outbound frame.
#[derive(Debug)]
enum Wire {
    Json(serde_json::Value),
    Audio(usize),
}

fn decode(outbound: Outbound) -> Option<Wire> {
    match outbound {
        Outbound::Text(text) => Some(Wire::Json(serde_json::from_str(&text).ok()?)),
        Outbound::Frame(frame) => {
            Some(Wire::Json(serde_json::to_value(&frame).expect("serializable frame")))
        }
        Outbound::Audio(data) => Some(Wire::Audio(data.len())),
    }
}

async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Option<Wire> {
    decode(timeout(Duration::from_secs(3), rx.recv()).await.ok()??)
}

/// Collect frames until (and including) a `tts stop`, or until the stream
/// goes quiet.
async fn collect_until_stop(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Wire> {
    let mut frames = Vec::new();
    while let Some(frame) = next_frame(rx).await {
        let is_stop = matches!(
            &frame,
            Wire::Json(v) if v["type"] == "tts" && v["state"] == "stop"
        );
        frames.push(frame);
        if is_stop {
            break;
        }
    }
    frames
}

fn tts_states(frames: &[Wire]) -> Vec<(String, Option<String>)> {
    frames
        .iter()
        .filter_map(|f| match f {
            Wire::Json(v) if v["type"] == "tts" => Some((
                v["state"].as_str().unwrap_or_default().to_string(),
                v["text"].as_str().map(|t| t.to_string()),
            )),
            _ => None,
        })
        .collect()
}

fn greeting_harness(scripts: Vec<Vec<LlmEvent>>, function_call_mode: bool) -> (Harness, Arc<ScriptedLlm>) {
    let llm = Arc::new(ScriptedLlm::new(scripts));
    let providers = fake_providers(llm.clone(), function_call_mode);
    (harness(Config::default(), providers), llm)
}

#[tokio::test]
async fn welcome_carries_a_session_id() {
    let (h, _) = greeting_harness(Vec::new(), false);
    let id = h.shared.welcome["session_id"].as_str().expect("session_id in welcome");
    assert!(uuid::Uuid::parse_str(id).is_ok());
}

#[tokio::test]
async fn greeting_reply_streams_segments_in_order() {
    let script = ScriptedLlm::content_script(&["你好呀。", "今天过得", "怎么样？"]);
    let (mut h, llm) = greeting_harness(vec![script], false);

    // Audio ingest is suspended from end-of-speech until the reply finishes.
    h.shared.set_asr_ingest(false);
    dispatch::start_to_chat(&h.shared, "你好").await;

    let frames = collect_until_stop(&mut h.outbound).await;

    // Recognition echo, UI cue, then the reply stream.
    assert!(matches!(&frames[0], Wire::Json(v) if v["type"] == "stt" && v["text"] == "你好"));
    assert!(matches!(&frames[1], Wire::Json(v) if v["type"] == "llm" && v["emotion"] == "happy"));

    let states = tts_states(&frames);
    let expected = vec![
        ("start".to_string(), None),
        ("sentence_start".to_string(), Some("你好呀".to_string())),
        ("sentence_end".to_string(), Some("你好呀".to_string())),
        ("sentence_start".to_string(), Some("今天过得怎么样".to_string())),
        ("sentence_end".to_string(), Some("今天过得怎么样".to_string())),
        ("stop".to_string(), None),
    ];
    assert_eq!(states, expected);

    // Audio frames land between each sentence_start and sentence_end.
    let audio_count = frames.iter().filter(|f| matches!(f, Wire::Audio(_))).count();
    assert_eq!(audio_count, 4);

    assert_eq!(llm.stream_calls.load(Ordering::SeqCst), 1);
    // The stop frame re-arms ingest and clears the segment indices.
    assert!(h.shared.asr_ingest_enabled());
    assert_eq!(h.shared.first_segment_index(), -1);
    assert_eq!(h.shared.last_segment_index(), -1);

    // The transcript carries system, user and one assistant turn.
    let transcript = h.shared.transcript.lock().await;
    let roles: Vec<Role> = transcript.turns().iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    assert_eq!(transcript.turns()[2].content, "你好呀。今天过得怎么样？");
}

#[tokio::test]
async fn abort_cuts_the_reply_and_sends_one_stop() {
    let script = ScriptedLlm::content_script(&[
        "第一句。", "第二句。", "第三句。", "第四句。", "第五句。",
    ]);
    let (mut h, _) = greeting_harness(vec![script], false);

    dispatch::start_to_chat(&h.shared, "讲五句话").await;

    // Let segment 2 finish, then barge in.
    let mut seen_ends = 0;
    let mut before_abort = Vec::new();
    while let Some(frame) = next_frame(&mut h.outbound).await {
        if let Wire::Json(v) = &frame {
            if v["type"] == "tts" && v["state"] == "sentence_end" {
                seen_ends += 1;
            }
        }
        before_abort.push(frame);
        if seen_ends == 2 {
            break;
        }
    }
    assert_eq!(seen_ends, 2, "reply should have been playing before the abort");
    assert!(before_abort.iter().any(|f| matches!(f, Wire::Audio(_))));
    h.shared.handle_abort().await;

    // Drain what follows; the channel goes quiet once everything is skipped.
    let mut after_abort = Vec::new();
    while let Ok(Some(outbound)) =
        timeout(Duration::from_millis(800), h.outbound.recv()).await
    {
        if let Some(frame) = decode(outbound) {
            after_abort.push(frame);
        }
    }

    let stops = after_abort
        .iter()
        .filter(
            |f| matches!(f, Wire::Json(v) if v["type"] == "tts" && v["state"] == "stop"),
        )
        .count();
    assert_eq!(stops, 1, "exactly one stop after abort");

    // No segment at or beyond 4 may start: at most the in-flight segment 3.
    for frame in &after_abort {
        if let Wire::Json(v) = frame {
            if v["type"] == "tts" && v["state"] == "sentence_start" {
                assert_eq!(v["text"], "第三句");
            }
        }
    }

    // Abort resynchronized the session for the next utterance.
    assert!(h.shared.asr_ingest_enabled());
    assert_eq!(h.shared.first_segment_index(), -1);
}

#[tokio::test]
async fn direct_exit_speaks_farewell_without_llm_and_closes() {
    let (mut h, llm) = greeting_harness(Vec::new(), false);

    dispatch::start_to_chat(&h.shared, "退出。").await;
    let frames = collect_until_stop(&mut h.outbound).await;

    assert_eq!(llm.stream_calls.load(Ordering::SeqCst), 0, "no LLM call for a literal exit");

    let states = tts_states(&frames);
    assert!(states
        .iter()
        .any(|(state, text)| state == "sentence_start"
            && text.as_deref().map(|t| t.contains("再见")).unwrap_or(false)));
    assert_eq!(states.last().map(|(s, _)| s.as_str()), Some("stop"));

    // After the farewell's stop, the server closes the session.
    timeout(Duration::from_secs(1), h.shared.closed()).await.expect("session close requested");
}

#[tokio::test]
async fn markdown_tool_call_round_trip() {
    let tool_reply = "```json\n{\"name\":\"set_device_property\",\"arguments\":\
                      {\"name\":\"Speaker\",\"method\":\"SetVolume\",\"parameters\":{\"volume\":50}}}\n```";
    let scripts = vec![
        ScriptedLlm::content_script(&[tool_reply]),
        ScriptedLlm::content_script(&["好的，音量已经调到50了。"]),
    ];
    let (mut h, llm) = greeting_harness(scripts, true);

    // The device declared its Speaker capability earlier in the session.
    let descriptor = serde_json::from_value(serde_json::json!({
        "name": "Speaker",
        "description": "扬声器",
        "properties": {"volume": {"description": "音量", "type": "number"}},
        "methods": {"SetVolume": {"description": "设置音量",
            "parameters": {"volume": {"description": "0-100", "type": "number"}}}}
    }))
    .unwrap();
    handle_iot_descriptors(&h.shared, vec![descriptor]).await;

    // Registration immediately pushes the configured default volume.
    let Some(Wire::Json(default_cmd)) = next_frame(&mut h.outbound).await else {
        panic!("expected default volume command");
    };
    assert_eq!(default_cmd["type"], "iot");
    assert_eq!(default_cmd["commands"][0]["method"], "SetVolume");
    assert_eq!(default_cmd["commands"][0]["parameters"]["volume"], 100);

    dispatch::start_to_chat(&h.shared, "把音量调到50").await;
    let frames = collect_until_stop(&mut h.outbound).await;

    // The fenced tool-call text is never spoken.
    for (state, text) in tts_states(&frames) {
        if state == "sentence_start" {
            let text = text.unwrap_or_default();
            assert!(!text.contains("json"), "tool-call content leaked into speech: {}", text);
        }
    }

    // The tool emitted the device command with the requested volume.
    let volume_cmd = frames.iter().find_map(|f| match f {
        Wire::Json(v)
            if v["type"] == "iot" && v["commands"][0]["parameters"]["volume"] == 50 =>
        {
            Some(v.clone())
        }
        _ => None,
    });
    assert!(volume_cmd.is_some(), "SetVolume(50) command not sent");

    // The follow-up invocation produced the spoken confirmation.
    assert_eq!(llm.stream_calls.load(Ordering::SeqCst), 2);
    assert!(tts_states(&frames).iter().any(|(state, text)| state == "sentence_start"
        && text.as_deref().map(|t| t.contains("音量已经调到50")).unwrap_or(false)));

    // Transcript consistency: the tool turn answers the assistant record.
    let transcript = h.shared.transcript.lock().await;
    let call_id = transcript
        .turns()
        .iter()
        .find_map(|t| t.tool_calls.as_ref().map(|c| c[0].id.clone()))
        .expect("assistant tool-call record");
    let tool_turn = transcript
        .turns()
        .iter()
        .find(|t| t.role == Role::Tool)
        .expect("tool-result turn");
    assert_eq!(tool_turn.tool_call_id.as_deref(), Some(call_id.as_str()));
}

#[tokio::test]
async fn music_playback_announces_then_streams_the_file() {
    // A real (tiny) WAV in a temp music directory.
    let dir = tempfile::tempdir().unwrap();
    let samples = vec![0i16; 16000 / 2]; // 0.5s of silence
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(dir.path().join("春天.wav"), spec).unwrap();
    for &s in &samples {
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();

    let mut config = Config::default();
    config.music.music_dir = dir.path().to_string_lossy().to_string();
    let llm = Arc::new(ScriptedLlm::new(Vec::new()));
    let mut h = harness(config, fake_providers(llm.clone(), false));

    h.shared.music.play(&h.shared, Some("春天")).await.unwrap();
    let frames = collect_until_stop(&mut h.outbound).await;

    // The announcement is a text-only recognition frame, never synthesized.
    assert!(matches!(
        &frames[0],
        Wire::Json(v) if v["type"] == "stt" && v["text"] == "正在播放春天.wav"
    ));
    assert!(matches!(&frames[1], Wire::Json(v) if v["type"] == "llm"));

    // The file is the single emitter item of the reply.
    let states = tts_states(&frames);
    let expected = vec![
        ("start".to_string(), None),
        ("sentence_start".to_string(), Some("春天.wav".to_string())),
        ("sentence_end".to_string(), Some("春天.wav".to_string())),
        ("stop".to_string(), None),
    ];
    assert_eq!(states, expected);
    assert_eq!(llm.stream_calls.load(Ordering::SeqCst), 0);

    // The file's frames arrive between sentence_start and sentence_end.
    let audio_count = frames.iter().filter(|f| matches!(f, Wire::Audio(_))).count();
    assert!(audio_count > 5, "expected the file's audio frames, got {}", audio_count);
}
