//! 本地鍵值儲存，以及建立在其上的提示詞儲存庫。

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::agent::error::Result;
use crate::agent::message::AgentPrompt;

/// 外部提供的鍵值持久化介面。
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// 只存在於記憶體中的儲存。
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }
}

/// 將所有鍵值存成單一 JSON 物件檔。
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    // 序列化讀寫，避免同時寫入時互相覆蓋。
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<Map<String, Value>> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) if raw.is_empty() => Ok(Map::new()),
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut all = self.read_all().await?;
        all.insert(key.to_string(), value);
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_vec_pretty(&all)?).await?;
        Ok(())
    }
}

/// 提示詞存放的鍵。
const PROMPTS_KEY: &str = "prompts";

type PromptsByAgent = BTreeMap<String, Vec<AgentPrompt>>;

/// 以代理 id 為鍵、將提示詞保存在本地儲存的儲存庫。
///
/// 每次寫入後，該代理的提示詞都依名稱遞增排序。所有提示詞共用同一個鍵，
/// 因此讀改寫都在 `write_lock` 內完成；複製出的儲存庫共用同一把鎖。
#[derive(Clone)]
pub struct LocalPromptsRepository {
    store: Arc<dyn KeyValueStore>,
    write_lock: Arc<Mutex<()>>,
}

impl LocalPromptsRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load(&self) -> Result<PromptsByAgent> {
        match self.store.get(PROMPTS_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(PromptsByAgent::new()),
        }
    }

    async fn update(&self, prompts: &PromptsByAgent) -> Result<()> {
        self.store
            .set(PROMPTS_KEY, serde_json::to_value(prompts)?)
            .await
    }

    /// 在鎖內修改單一代理的提示詞並排序寫回。
    async fn modify<F>(&self, agent_id: &str, change: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<AgentPrompt>),
    {
        let _guard = self.write_lock.lock().await;
        let mut all = self.load().await?;
        let prompts = all.entry(agent_id.to_string()).or_default();
        change(prompts);
        sort_by_name(prompts);
        self.update(&all).await
    }

    pub async fn find_by_agent_id(&self, agent_id: &str) -> Result<Vec<AgentPrompt>> {
        Ok(self.load().await?.remove(agent_id).unwrap_or_default())
    }

    /// 新增或取代相同 id 的提示詞。
    pub async fn save(&self, prompt: &AgentPrompt, agent_id: &str) -> Result<()> {
        self.modify(agent_id, |prompts| {
            prompts.retain(|p| p.id != prompt.id);
            prompts.push(prompt.clone());
        })
        .await
    }

    /// 以 [`next_prompt_id`] 指派 id 後新增，回傳帶有 id 的提示詞。
    pub async fn insert_new(&self, mut prompt: AgentPrompt, agent_id: &str) -> Result<AgentPrompt> {
        self.modify(agent_id, |prompts| {
            prompt.id = Some(next_prompt_id(prompts));
            prompts.push(prompt.clone());
        })
        .await?;
        Ok(prompt)
    }

    /// 代理沒有任何提示詞時寫入 `seeded`；回傳是否有寫入。
    pub async fn seed(&self, seeded: Vec<AgentPrompt>, agent_id: &str) -> Result<bool> {
        let mut written = false;
        self.modify(agent_id, |prompts| {
            if prompts.is_empty() {
                prompts.extend(seeded);
                written = true;
            }
        })
        .await?;
        Ok(written)
    }

    pub async fn delete_by_id_and_agent_id(&self, id: i64, agent_id: &str) -> Result<()> {
        self.modify(agent_id, |prompts| prompts.retain(|p| p.id != Some(id)))
            .await
    }

    pub async fn delete_by_agent_id(&self, agent_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.load().await?;
        all.remove(agent_id);
        self.update(&all).await
    }
}

fn sort_by_name(prompts: &mut [AgentPrompt]) {
    prompts.sort_by(|a, b| a.name.cmp(&b.name));
}

/// 下一個本地提示詞 id：現有最大值加一；沒有任何提示詞時從 1 開始。
pub fn next_prompt_id(prompts: &[AgentPrompt]) -> i64 {
    prompts
        .iter()
        .filter_map(|p| p.id)
        .max()
        .map_or(1, |max| max + 1)
}
