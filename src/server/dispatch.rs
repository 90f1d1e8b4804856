//! Dispatcher: the ASR → intent → LLM → TTS progression
//!
//! One logical owner per session for the current utterance. Routes recognized
//! text through the exit check and the optional intent classifier, streams
//! the LLM reply through the segmenter into the TTS queue, and implements the
//! tool-call protocol (structured deltas and the markdown-fenced fallback).

use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::dialogue::Turn;
use crate::music;
use crate::providers::intent::intent_label;
use crate::providers::llm::{FunctionPayload, LlmEvent, ToolCallPayload};
use crate::server::session::{SessionShared, TtsState};
use crate::tools::{Action, ToolCallData};
use crate::utils::{extract_json_from_string, remove_punctuation_and_length,
    strip_punctuation_and_emoji};

/// Spoken acknowledgement for a literal exit command.
const FAREWELL: &str = "好的，再见，期待我们下次相遇。";

// ─── Entry point ─────────────────────────────────────────────

/// Handle recognized (or injected) user text: intent layer first, then the
/// generation pipeline on a worker task. The inbound reader never waits on
/// generation.
pub async fn start_to_chat(shared: &Arc<SessionShared>, text: &str) {
    match handle_user_intent(shared, text).await {
        Ok(true) => {
            shared.set_asr_ingest(true);
            return;
        }
        Ok(false) => {}
        Err(e) => warn!("intent handling failed, falling through to chat: {}", e),
    }

    shared.send_stt_flow(text).await;
    let shared = shared.clone();
    let query = text.to_string();
    tokio::spawn(async move {
        if shared.providers.function_call_mode {
            chat_with_tools(&shared, &query, false).await;
        } else {
            chat(&shared, &query).await;
        }
    });
}

// ─── Intent layer ────────────────────────────────────────────

/// Returns true when the utterance was fully handled locally.
async fn handle_user_intent(shared: &Arc<SessionShared>, text: &str) -> Result<bool> {
    if check_direct_exit(shared, text).await {
        return Ok(true);
    }
    // Shortcut mode: everything else goes to the LLM with tools enabled.
    let Some(classifier) = &shared.providers.intent else {
        return Ok(false);
    };

    let raw = {
        let transcript = shared.transcript.lock().await;
        let tail: Vec<Turn> = transcript.tail(2).into_iter().cloned().collect();
        classifier.detect(&tail, text, &shared.music.files()).await?
    };
    let label = intent_label(&raw);

    if label.contains("结束聊天") || label.contains("end_chat") {
        info!("end-of-chat intent: {}", label);
        shared.send_stt_flow(text).await;
        shared.set_close_after_reply(true);
        let shared = shared.clone();
        let query = text.to_string();
        tokio::spawn(async move { chat(&shared, &query).await });
        return Ok(true);
    }

    if label.contains("播放音乐") || label.contains("play_music") {
        info!("play-music intent: {}", label);
        let requested =
            music::extract_song_name(&label).or_else(|| music::extract_song_name(text));
        if let Err(e) = shared.music.play(shared, requested.as_deref()).await {
            warn!("music playback failed: {}", e);
            shared.send_tts_state(TtsState::Stop, None).await;
        }
        return Ok(true);
    }

    Ok(false)
}

/// Literal exit command: equality after stripping punctuation and whitespace.
/// Speaks a fixed farewell and closes once it has been delivered.
async fn check_direct_exit(shared: &Arc<SessionShared>, text: &str) -> bool {
    let (_, cleaned) = remove_punctuation_and_length(text);
    if !shared.config.cmd_exit.iter().any(|cmd| cleaned == *cmd) {
        return false;
    }
    info!("explicit exit command: {}", cleaned);
    shared.send_stt_flow(text).await;
    shared.set_close_after_reply(true);
    shared.set_llm_finished(true);
    dispatch_segment(shared, FAREWELL, 1);
    let mut transcript = shared.transcript.lock().await;
    transcript.push(Turn::user(text));
    transcript.push(Turn::assistant(FAREWELL));
    true
}

// ─── Generation ──────────────────────────────────────────────

async fn query_memory(shared: &Arc<SessionShared>, query: &str) -> String {
    let device_id = shared.device_id.as_deref().unwrap_or("default");
    match shared.providers.memory.query(device_id, query).await {
        Ok(memory) => memory,
        Err(e) => {
            warn!("memory query failed: {}", e);
            String::new()
        }
    }
}

fn dispatch_segment(shared: &Arc<SessionShared>, text: &str, index: i32) {
    if shared.first_segment_index() == -1 {
        info!("first reply segment: {}", text);
    }
    shared.record_segment_index(index);
    shared.submit_tts(text.to_string(), index);
}

/// Plain streaming chat (classifier mode, no tool schemas).
pub async fn chat(shared: &Arc<SessionShared>, query: &str) {
    shared.transcript.lock().await.push(Turn::user(query));
    shared.set_llm_finished(false);

    let memory = query_memory(shared, query).await;
    let messages = shared.transcript.lock().await.render_with_memory(&memory);
    let mut stream = match shared.providers.llm.chat_stream(&shared.session_id, messages, None).await
    {
        Ok(stream) => stream,
        Err(e) => {
            error!("LLM request failed for \"{}\": {}", query, e);
            shared.send_tts_state(TtsState::Stop, None).await;
            return;
        }
    };

    let mut segmenter = Segmenter::new();
    let mut text_index = 0;
    while let Some(event) = stream.recv().await {
        let LlmEvent::Content(delta) = event else { continue };
        segmenter.push(&delta);
        if shared.is_aborted() {
            debug!("reply aborted mid-stream");
            break;
        }
        if let Some(segment) = segmenter.try_emit() {
            text_index += 1;
            dispatch_segment(shared, &segment, text_index);
        }
    }

    if let Some(tail) = segmenter.drain_tail() {
        text_index += 1;
        dispatch_segment(shared, &tail, text_index);
    }

    shared.set_llm_finished(true);
    if !segmenter.full_text().is_empty() {
        shared.transcript.lock().await.push(Turn::assistant(segmenter.full_text()));
    }
}

/// Streaming chat with tool schemas and the tool-call protocol. `tool_call`
/// marks a follow-up invocation after a tool result; the user turn is only
/// appended on the initial call.
pub fn chat_with_tools<'a>(
    shared: &'a Arc<SessionShared>,
    query: &'a str,
    tool_call: bool,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        if !tool_call {
            shared.transcript.lock().await.push(Turn::user(query));
        }
        shared.set_llm_finished(false);

        let memory = query_memory(shared, query).await;
        let messages = shared.transcript.lock().await.render_with_memory(&memory);
        let tools = shared.tools.schemas();
        let mut stream = match shared
            .providers
            .llm
            .chat_stream(&shared.session_id, messages, Some(tools))
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                error!("LLM request failed for \"{}\": {}", query, e);
                shared.send_tts_state(TtsState::Stop, None).await;
                return;
            }
        };

        let mut segmenter = Segmenter::new();
        let mut text_index = 0;
        let mut tool_flag = false;
        let mut function_id: Option<String> = None;
        let mut function_name: Option<String> = None;
        let mut function_args = String::new();
        let mut content_args = String::new();

        while let Some(event) = stream.recv().await {
            match event {
                LlmEvent::ToolCall(delta) => {
                    tool_flag = true;
                    if let Some(id) = delta.id.filter(|i| !i.is_empty()) {
                        function_id = Some(id);
                    }
                    if let Some(name) = delta.name.filter(|n| !n.is_empty()) {
                        function_name = Some(name);
                    }
                    if let Some(args) = delta.arguments {
                        function_args.push_str(&args);
                    }
                }
                LlmEvent::Content(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    // Markdown-style tool calls: the reply opens with a fence
                    // or a <tool_call> tag instead of structured deltas.
                    if segmenter.is_empty()
                        && !tool_flag
                        && (delta.starts_with("```") || delta.contains("<tool_call>"))
                    {
                        tool_flag = true;
                    }
                    if tool_flag {
                        content_args.push_str(&delta);
                        continue;
                    }
                    segmenter.push(&delta);
                    if shared.is_aborted() {
                        debug!("reply aborted mid-stream");
                        break;
                    }
                    if let Some(segment) = segmenter.try_emit() {
                        text_index += 1;
                        dispatch_segment(shared, &segment, text_index);
                    }
                }
            }
        }

        if tool_flag {
            let mut parse_failed = false;
            if function_id.is_none() {
                // Markdown form: dig the {name, arguments} object out of the
                // accumulated text and mint a call id.
                match extract_json_from_string(&content_args) {
                    Some(json) => match serde_json::from_str::<serde_json::Value>(json) {
                        Ok(value) if value.get("name").is_some() => {
                            function_name =
                                value["name"].as_str().map(|s| s.to_string());
                            function_args = value
                                .get("arguments")
                                .cloned()
                                .unwrap_or_else(|| serde_json::json!({}))
                                .to_string();
                            function_id =
                                Some(uuid::Uuid::new_v4().simple().to_string());
                        }
                        _ => {
                            parse_failed = true;
                            segmenter.push(json);
                        }
                    },
                    None => {
                        parse_failed = true;
                        segmenter.push(&content_args);
                    }
                }
            }
            if parse_failed {
                // Surface the raw tool-call text as assistant content.
                error!("tool call parse failure: {}", content_args);
            } else {
                let arguments: serde_json::Value =
                    serde_json::from_str(&function_args).unwrap_or_else(|_| serde_json::json!({}));
                let call = ToolCallData {
                    id: function_id.unwrap_or_default(),
                    name: function_name.unwrap_or_default(),
                    arguments,
                };
                info!("tool call: {} ({}) args={}", call.name, call.id, call.arguments);
                let action = shared.tools.dispatch(shared, &call).await;
                handle_tool_action(shared, action, &call, text_index + 1).await;
            }
        }

        if let Some(tail) = segmenter.drain_tail() {
            text_index += 1;
            dispatch_segment(shared, &tail, text_index);
        }

        if !segmenter.full_text().is_empty() {
            shared.transcript.lock().await.push(Turn::assistant(segmenter.full_text()));
        }
        shared.set_llm_finished(true);
    })
}

async fn handle_tool_action(
    shared: &Arc<SessionShared>,
    action: Action,
    call: &ToolCallData,
    text_index: i32,
) {
    match action {
        Action::Response(text) => {
            // An empty response means the tool queued its own audio.
            if text.is_empty() {
                return;
            }
            dispatch_segment(shared, &text, text_index);
            shared.transcript.lock().await.push(Turn::assistant(text));
        }
        Action::ReqLlm(text) => {
            if text.is_empty() {
                return;
            }
            let record = ToolCallPayload {
                id: call.id.clone(),
                r#type: "function".to_string(),
                function: FunctionPayload {
                    name: call.name.clone(),
                    arguments: call.arguments.to_string(),
                },
            };
            {
                let mut transcript = shared.transcript.lock().await;
                transcript.push(Turn::assistant_tool_call(vec![record]));
                transcript.push(Turn::tool_result(&call.id, &text));
            }
            chat_with_tools(shared, &text, true).await;
        }
        Action::NotFound(text) => {
            warn!("tool dispatch found nothing: {}", text);
        }
    }
}

// ─── Segmenter ───────────────────────────────────────────────

/// Chinese sentence terminators that bound speakable segments.
const TERMINATORS: [char; 5] = ['。', '？', '！', '；', '：'];

/// Splits a streamed reply into speakable chunks at sentence terminators.
/// Stateful over a single reply: raw consumed spans are tracked so the
/// concatenation of raw segments is always a prefix of the reply text.
#[derive(Debug, Default)]
pub struct Segmenter {
    full: String,
    processed: usize,
}

impl Segmenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &str) {
        self.full.push_str(delta);
    }

    /// Emit everything up to the latest terminator in the unprocessed span,
    /// stripped of surrounding punctuation and emoji. Advances only when the
    /// stripped segment is non-empty.
    pub fn try_emit(&mut self) -> Option<String> {
        let tail = &self.full[self.processed..];
        let mut end = None;
        for (i, c) in tail.char_indices() {
            if TERMINATORS.contains(&c) {
                end = Some(i + c.len_utf8());
            }
        }
        let raw_end = self.processed + end?;
        let segment = strip_punctuation_and_emoji(&self.full[self.processed..raw_end]).to_string();
        if segment.is_empty() {
            return None;
        }
        self.processed = raw_end;
        Some(segment)
    }

    /// End-of-reply: the residual unpunctuated tail, if any survives the strip.
    pub fn drain_tail(&mut self) -> Option<String> {
        if self.processed >= self.full.len() {
            return None;
        }
        let segment = strip_punctuation_and_emoji(&self.full[self.processed..]).to_string();
        self.processed = self.full.len();
        if segment.is_empty() {
            None
        } else {
            Some(segment)
        }
    }

    pub fn full_text(&self) -> &str {
        &self.full
    }

    pub fn is_empty(&self) -> bool {
        self.full.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_at_latest_terminator() {
        let mut seg = Segmenter::new();
        seg.push("你好。今天天气");
        assert_eq!(seg.try_emit().as_deref(), Some("你好"));
        // No new terminator yet.
        assert!(seg.try_emit().is_none());
        seg.push("不错！要出门吗");
        assert_eq!(seg.try_emit().as_deref(), Some("今天天气不错"));
        assert_eq!(seg.drain_tail().as_deref(), Some("要出门吗"));
        assert!(seg.drain_tail().is_none());
    }

    #[test]
    fn one_delta_with_two_sentences_is_one_segment() {
        let mut seg = Segmenter::new();
        seg.push("第一句。第二句？尾巴");
        assert_eq!(seg.try_emit().as_deref(), Some("第一句。第二句"));
        assert_eq!(seg.drain_tail().as_deref(), Some("尾巴"));
    }

    #[test]
    fn raw_spans_cover_a_prefix_of_the_reply() {
        let reply = "一二三。四五六！七八九；尾声";
        let mut seg = Segmenter::new();
        let mut consumed = String::new();
        for c in reply.chars() {
            seg.push(&c.to_string());
            if seg.try_emit().is_some() {
                consumed = seg.full_text()[..seg.processed].to_string();
                assert!(reply.starts_with(&consumed));
            }
        }
        assert_eq!(consumed, "一二三。四五六！七八九；");
        assert_eq!(seg.drain_tail().as_deref(), Some("尾声"));
        assert_eq!(seg.full_text(), reply);
    }

    #[test]
    fn punctuation_only_segment_does_not_advance() {
        let mut seg = Segmenter::new();
        seg.push("。。。");
        assert!(seg.try_emit().is_none());
        seg.push("好的。");
        assert_eq!(seg.try_emit().as_deref(), Some("好的"));
        assert!(seg.drain_tail().is_none());
    }

    #[test]
    fn emoji_and_padding_are_stripped_from_segment_ends() {
        let mut seg = Segmenter::new();
        seg.push("😊 你好呀！");
        assert_eq!(seg.try_emit().as_deref(), Some("你好呀"));
    }
}
