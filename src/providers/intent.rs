//! LLM-backed intent classification
//!
//! Classifier mode asks the LLM to label the newest user utterance as one of
//! {continue_chat, end_chat, play_music} given the last two transcript turns
//! and the locally available music files. In shortcut mode (`function_call`)
//! no classifier runs and everything goes to the LLM with tools enabled.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::dialogue::Turn;
use crate::providers::llm::Llm;

const DEFAULT_INTENT: &str = "{intent: '继续聊天'}";

static INTENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{.*?\}").expect("valid regex"));

fn classifier_prompt(music_files: &[String]) -> String {
    format!(
        "你是一个意图识别助手。你需要根据和用户的对话记录，重点分析用户的最后一句话，\
         判断用户意图属于以下哪一类(使用<start>和<end>标志)：\n<start>\
         1.继续聊天, 除了播放音乐和结束聊天的时候的选项, 比如日常的聊天和问候, 对话等, \
         2.结束聊天, 用户发来如再见之类的表示结束的话, 不想再进行对话的时候, \
         3.播放音乐, 用户希望你可以播放音乐, 只用于播放音乐的意图<end>\n\
         你需要按照以下的步骤处理用户的对话：\n\
         1. 思考出对话的意图是哪一类的。\n\
         2. 属于1和2的意图, 直接返回，返回格式如下：\n{{intent: '用户意图'}}\n\
         3. 属于3的意图，则继续分析用户希望播放的音乐，返回：\n\
         {{intent: '播放音乐 [获取的音乐名字]'}}\n\
         4. 如果无法识别出具体歌名，可以返回'随机播放音乐'。\n\
         只返回json部分, 无额外的内容。\n\
         你现在可以使用的音乐的名称如下(使用<start>和<end>标志)：\n\
         <start>{:?}<end>",
        music_files
    )
}

/// Classifier over the transcript tail. Only constructed when
/// `selected_module.Intent` names it; shortcut mode has no instance.
pub struct LlmIntent {
    llm: Arc<dyn Llm>,
}

impl LlmIntent {
    pub fn new(llm: Arc<dyn Llm>) -> Self {
        Self { llm }
    }

    /// Returns the raw intent expression, e.g. `{intent: '播放音乐 [春天]'}`.
    /// Falls back to "继续聊天" when the model produces nothing usable.
    pub async fn detect(
        &self,
        tail: &[Turn],
        text: &str,
        music_files: &[String],
    ) -> Result<String> {
        let mut dialogue = String::new();
        for turn in tail {
            dialogue.push_str(&format!("{}: {}\n", turn.role.as_str(), turn.content));
        }
        dialogue.push_str(&format!("user: {}\n", text));
        let user_prompt = format!("当前的对话如下：\n{}", dialogue);

        let reply = match self.llm.chat_once(&classifier_prompt(music_files), &user_prompt).await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!("intent classification failed: {}", e);
                return Ok(DEFAULT_INTENT.to_string());
            }
        };
        debug!("intent classifier reply: {}", reply);

        let intent = match INTENT_RE.find(&reply) {
            Some(m) => m.as_str().to_string(),
            None => DEFAULT_INTENT.to_string(),
        };
        info!("Detected intent: {}", intent);
        Ok(intent)
    }
}

/// Resolve the raw classifier expression to the intent label. The reply is
/// parsed as JSON of shape `{"intent": "..."}`; models that emit the
/// single-quoted pseudo-JSON form fall back to the raw text, which still
/// carries the label as a substring.
pub fn intent_label(raw: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
        if let Some(label) = value.get("intent").and_then(|i| i.as_str()) {
            return label.to_string();
        }
    }
    raw.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_from_valid_json() {
        assert_eq!(intent_label(r#"{"intent": "结束聊天"}"#), "结束聊天");
    }

    #[test]
    fn label_falls_back_to_raw_text() {
        let raw = "{intent: '播放音乐 [春天]'}";
        let label = intent_label(raw);
        assert!(label.contains("播放音乐"));
        assert!(label.contains("春天"));
    }
}
