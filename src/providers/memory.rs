//! Conversation memory providers
//!
//! The core sees two operations: save the finished transcript, query a
//! free-form string for the next reply. The disk-backed variant keeps one
//! YAML file mapping device id to an opaque memory string, summarized by the
//! LLM at session end. `data/.memory.yaml` access goes through the
//! process-wide [`FileLockManager`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::dialogue::{Role, Turn};
use crate::providers::llm::Llm;
use crate::utils::extract_json_from_string;

/// Per-path advisory locks, created once in the server bootstrap and passed
/// by Arc. Lock granularity is the canonical path string.
#[derive(Default)]
pub struct FileLockManager {
    locks: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl FileLockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(path.to_path_buf()).or_default().clone()
    }
}

#[async_trait]
pub trait Memory: Send + Sync {
    /// Persist whatever the provider wants to remember from the transcript.
    async fn save(&self, device_id: &str, transcript: &[Turn]) -> Result<()>;
    /// Retrieve the memory string for this device, empty when none.
    async fn query(&self, device_id: &str, query: &str) -> Result<String>;
}

/// No-op provider, the default.
pub struct NoMemory;

#[async_trait]
impl Memory for NoMemory {
    async fn save(&self, _device_id: &str, _transcript: &[Turn]) -> Result<()> {
        Ok(())
    }

    async fn query(&self, _device_id: &str, _query: &str) -> Result<String> {
        Ok(String::new())
    }
}

const SUMMARY_PROMPT: &str = r#"# 时空记忆编织者

## 核心使命
根据对话记录，总结user的重要信息，构建可生长的动态记忆网络，
在有限空间内保留关键信息，以便未来的对话提供更个性化的服务。

## 记忆法则
1. 评估信息的时效性、情感强度和关联密度，优先保留高价值条目。
2. 检测到「我叫X」「称呼我Y」等命名信号时，更新现用名并保留曾用名。
3. 总字数接近上限时压缩或合并相似条目，保留时间戳最近的。

## 记忆结构
输出格式必须为可解析的json字符串，不需要解释、注释和说明，
保存记忆时仅从对话提取信息，不要混入示例内容：
```json
{
  "时空档案": {
    "身份图谱": {"现用名": "", "特征标记": []},
    "记忆立方": [{"事件": "", "时间戳": "", "情感值": 0.5, "关联项": []}]
  },
  "关系网络": {"高频话题": {}},
  "待响应": {"紧急事项": [], "潜在关怀": []},
  "高光语录": []
}
```"#;

#[derive(Debug, Clone, Deserialize)]
pub struct YamlMemoryConfig {
    #[serde(default = "default_memory_path")]
    pub memory_path: String,
}

fn default_memory_path() -> String {
    "data/.memory.yaml".to_string()
}

/// Disk-backed short-term memory: one YAML map of device id → memory string.
pub struct YamlMemory {
    path: PathBuf,
    llm: Arc<dyn Llm>,
    locks: Arc<FileLockManager>,
}

impl YamlMemory {
    pub fn new(
        block: serde_yaml::Value,
        llm: Arc<dyn Llm>,
        locks: Arc<FileLockManager>,
    ) -> Result<Self> {
        let config: YamlMemoryConfig = if block.is_null() {
            YamlMemoryConfig { memory_path: default_memory_path() }
        } else {
            serde_yaml::from_value(block).context("invalid memory config")?
        };
        Ok(Self { path: PathBuf::from(config.memory_path), llm, locks })
    }

    fn load_all(&self) -> HashMap<String, String> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_yaml::from_str(&raw).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }

    fn store_all(&self, all: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("failed to create memory directory")?;
        }
        let raw = serde_yaml::to_string(all).context("failed to serialize memory")?;
        std::fs::write(&self.path, raw).context("failed to write memory file")?;
        Ok(())
    }
}

#[async_trait]
impl Memory for YamlMemory {
    async fn save(&self, device_id: &str, transcript: &[Turn]) -> Result<()> {
        let spoken: Vec<&Turn> = transcript
            .iter()
            .filter(|t| matches!(t.role, Role::User | Role::Assistant) && !t.content.is_empty())
            .collect();
        if spoken.len() < 2 {
            return Ok(());
        }

        let mut prompt = String::new();
        for turn in &spoken {
            let speaker = if turn.role == Role::User { "User" } else { "Assistant" };
            prompt.push_str(&format!("{}: {}\n", speaker, turn.content));
        }

        let lock = self.locks.lock_for(&self.path);
        let _guard = lock.lock().await;

        let mut all = self.load_all();
        if let Some(previous) = all.get(device_id).filter(|m| !m.is_empty()) {
            prompt.push_str("历史记忆：\n");
            prompt.push_str(previous);
            prompt.push('\n');
        }
        prompt.push_str(&format!(
            "当前时间：{}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        ));

        let reply = self.llm.chat_once(SUMMARY_PROMPT, &prompt).await?;
        // Prefer the JSON body, but keep the raw text when the model refuses
        // to produce parseable JSON; an opaque string is still a memory.
        let memory = match extract_json_from_string(&reply) {
            Some(json) if serde_json::from_str::<serde_json::Value>(json).is_ok() => {
                json.to_string()
            }
            _ => {
                warn!("memory summary was not valid JSON, keeping raw text");
                reply
            }
        };

        all.insert(device_id.to_string(), memory);
        self.store_all(&all)?;
        info!("Saved memory for device {}", device_id);
        Ok(())
    }

    async fn query(&self, device_id: &str, _query: &str) -> Result<String> {
        let lock = self.locks.lock_for(&self.path);
        let _guard = lock.lock().await;
        Ok(self.load_all().get(device_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedLlm(String);

    #[async_trait]
    impl Llm for CannedLlm {
        async fn chat_stream(
            &self,
            _session_id: &str,
            _messages: Vec<crate::providers::llm::ChatMessage>,
            _tools: Option<Vec<crate::providers::llm::ToolDefinition>>,
        ) -> Result<tokio::sync::mpsc::Receiver<crate::providers::llm::LlmEvent>> {
            anyhow::bail!("not used")
        }

        async fn chat_once(&self, _system: &str, _user: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    fn memory_with_reply(dir: &Path, reply: &str) -> YamlMemory {
        let block = serde_yaml::to_value(HashMap::from([(
            "memory_path".to_string(),
            dir.join("mem.yaml").to_string_lossy().to_string(),
        )]))
        .unwrap();
        YamlMemory::new(block, Arc::new(CannedLlm(reply.to_string())), FileLockManager::new())
            .unwrap()
    }

    fn sample_transcript() -> Vec<Turn> {
        vec![
            Turn::system("sys"),
            Turn::user("我叫张三，喜欢爵士乐"),
            Turn::assistant("记住了，张三"),
        ]
    }

    #[tokio::test]
    async fn save_extracts_json_and_query_returns_it() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory_with_reply(dir.path(), "```json\n{\"现用名\":\"张三\"}\n```");
        mem.save("dev-1", &sample_transcript()).await.unwrap();

        let stored = mem.query("dev-1", "whatever").await.unwrap();
        assert_eq!(stored, "{\"现用名\":\"张三\"}");
        assert_eq!(mem.query("dev-2", "x").await.unwrap(), "");
    }

    #[tokio::test]
    async fn non_json_summary_is_kept_raw() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory_with_reply(dir.path(), "用户叫张三，喜欢爵士乐");
        mem.save("dev-1", &sample_transcript()).await.unwrap();
        let stored = mem.query("dev-1", "x").await.unwrap();
        assert_eq!(stored, "用户叫张三，喜欢爵士乐");
    }

    #[tokio::test]
    async fn short_transcripts_are_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory_with_reply(dir.path(), "{}");
        mem.save("dev-1", &[Turn::system("sys"), Turn::user("hi")]).await.unwrap();
        assert_eq!(mem.query("dev-1", "x").await.unwrap(), "");
    }
}
