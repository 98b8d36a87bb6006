//! `providers` 模組負責提供與不同方言的代理後端通訊的具體實作。
//!
//! 兩種方言（`standalone`, `platform`）都實現了 `AgentBackend` trait，
//! 並由 [`Agent`] 依 [`AgentKind`] 在建構時選定。

// --- 子模組宣告 ---

/// `http` 模組：傳輸層與事件串流解碼。
pub mod http;
/// `mapper` 模組：事件到訊息部分的對照表。
pub mod mapper;
/// `platform` 模組：平台原生代理（threads API）。
pub mod platform;
/// `standalone` 模組：獨立部署的代理（sessions API）。
pub mod standalone;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::auth::CredentialFactory;
use crate::agent::config::ClientSettings;
use crate::agent::error::Result;
use crate::agent::manifest::{
    AgentManifest, AuthConfig, RequestEvent, STOP_CAPABILITY, TRANSCRIPTS_CAPABILITY,
};
use crate::agent::message::{AgentPrompt, AgentSession};
use crate::agent::store::{JsonFileStore, KeyValueStore, LocalPromptsRepository, MemoryStore};

pub use mapper::PartStream;
pub use platform::PlatformAgent;
pub use standalone::StandaloneAgent;

use http::HttpTransport;

/// 代理使用的後端方言。序列化值與持久化格式中的 `type` 欄位相同。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentKind {
    #[serde(rename = "agent")]
    Standalone,
    #[serde(rename = "tero")]
    Platform,
}

impl AgentKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            AgentKind::Standalone => "standalone",
            AgentKind::Platform => "platform",
        }
    }
}

/// 代理操作所需的外部協作者，明確傳入而非全域共享。
///
/// `credentials` 依簽發者提供憑證；代理只會拿到自己 manifest `auth` 對應的 token。
#[derive(Clone)]
pub struct AgentContext {
    pub http: reqwest::Client,
    pub credentials: Arc<dyn CredentialFactory>,
    pub store: Arc<dyn KeyValueStore>,
    pub settings: ClientSettings,
    /// 所有獨立代理共用的本地提示詞儲存庫。
    pub(crate) prompts: LocalPromptsRepository,
}

impl AgentContext {
    pub fn new(
        credentials: Arc<dyn CredentialFactory>,
        store: Arc<dyn KeyValueStore>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
            prompts: LocalPromptsRepository::new(store.clone()),
            store,
            settings,
        }
    }

    /// 依設定選擇儲存：有 `prompt_store_path` 時寫入 JSON 檔，否則只存在記憶體。
    pub fn from_settings(credentials: Arc<dyn CredentialFactory>, settings: ClientSettings) -> Self {
        let store: Arc<dyn KeyValueStore> = match &settings.prompt_store_path {
            Some(path) => Arc::new(JsonFileStore::new(path)),
            None => Arc::new(MemoryStore::new()),
        };
        Self::new(credentials, store, settings)
    }

    /// 建立傳輸層；沒有 `auth` 時不附加 bearer token。
    pub(crate) fn transport(&self, auth: Option<&AuthConfig>) -> HttpTransport {
        let credentials = auth.map(|auth| self.credentials.for_auth(auth));
        HttpTransport::new(self.http.clone(), credentials)
            .with_headers(self.settings.extra_headers.clone())
    }
}

/// 向代理提出的一個問題。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub text: String,
    pub session_id: String,
    /// 延續分支對話時的上一則訊息。
    pub parent_message_id: Option<i64>,
}

/// 錄製的音訊。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl AudioClip {
    pub fn webm(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            mime_type: String::from("audio/webm"),
        }
    }
}

/// 所有代理方言都必須提供的能力集合。
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn kind(&self) -> AgentKind;

    fn url(&self) -> &str;

    fn logo(&self) -> &str;

    fn manifest(&self) -> &AgentManifest;

    /// 開始新的對話，回傳後端指派的工作階段。
    async fn create_session(&self, locales: &[String]) -> Result<AgentSession>;

    /// 發問並取得惰性的回答序列；第一次輪詢時才送出請求。
    fn ask(&self, question: Question) -> PartStream;

    /// 透過側通道請求伺服器停止目前的回答。
    async fn stop_response(&self, session_id: &str) -> Result<()>;

    async fn transcribe_audio(&self, audio: AudioClip, session_id: &str) -> Result<String>;

    async fn solve_interaction_summary(&self, detail: Value, session_id: &str) -> Result<String>;

    async fn get_prompts(&self) -> Result<Vec<AgentPrompt>>;

    /// 儲存提示詞，回傳帶有 id 的結果。
    async fn save_prompt(&self, prompt: AgentPrompt) -> Result<AgentPrompt>;

    async fn delete_prompt(&self, id: i64) -> Result<()>;

    /// 代理註冊前的初始化。
    async fn setup(&self) -> Result<()>;

    /// 代理移除時的清理。
    async fn tear_down(&self) -> Result<()>;

    fn supports_stop_response(&self) -> bool {
        self.manifest().supports_capability(STOP_CAPABILITY)
    }

    fn supports_transcriptions(&self) -> bool {
        self.manifest().supports_capability(TRANSCRIPTS_CAPABILITY)
    }

    fn activates_on(&self, req: &RequestEvent) -> bool {
        self.manifest().activates_on(req)
    }
}

/// 代理的持久化格式。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    #[serde(rename = "type")]
    pub kind: AgentKind,
    pub url: String,
    pub logo: String,
    pub manifest: AgentManifest,
    /// 平台代理是否屬於某個團隊。
    #[serde(default)]
    pub shared: bool,
}

/// 依方言選定實作的代理。
pub enum Agent {
    Standalone(StandaloneAgent),
    Platform(PlatformAgent),
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Agent").field(&self.to_record()).finish()
    }
}

impl Agent {
    pub fn from_record(record: AgentRecord, ctx: &AgentContext) -> Self {
        match record.kind {
            AgentKind::Standalone => Agent::Standalone(StandaloneAgent::with_logo(
                record.url,
                record.manifest,
                record.logo,
                ctx,
            )),
            AgentKind::Platform => Agent::Platform(PlatformAgent::new(
                record.url,
                record.manifest,
                record.logo,
                record.shared,
                ctx,
            )),
        }
    }

    pub fn to_record(&self) -> AgentRecord {
        AgentRecord {
            kind: self.kind(),
            url: self.url().to_string(),
            logo: self.logo().to_string(),
            manifest: self.manifest().clone(),
            shared: match self {
                Agent::Standalone(_) => false,
                Agent::Platform(agent) => agent.is_shared(),
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest().id
    }

    fn backend(&self) -> &dyn AgentBackend {
        match self {
            Agent::Standalone(agent) => agent,
            Agent::Platform(agent) => agent,
        }
    }
}

#[async_trait]
impl AgentBackend for Agent {
    fn kind(&self) -> AgentKind {
        self.backend().kind()
    }

    fn url(&self) -> &str {
        self.backend().url()
    }

    fn logo(&self) -> &str {
        self.backend().logo()
    }

    fn manifest(&self) -> &AgentManifest {
        self.backend().manifest()
    }

    async fn create_session(&self, locales: &[String]) -> Result<AgentSession> {
        self.backend().create_session(locales).await
    }

    fn ask(&self, question: Question) -> PartStream {
        self.backend().ask(question)
    }

    async fn stop_response(&self, session_id: &str) -> Result<()> {
        self.backend().stop_response(session_id).await
    }

    async fn transcribe_audio(&self, audio: AudioClip, session_id: &str) -> Result<String> {
        self.backend().transcribe_audio(audio, session_id).await
    }

    async fn solve_interaction_summary(&self, detail: Value, session_id: &str) -> Result<String> {
        self.backend()
            .solve_interaction_summary(detail, session_id)
            .await
    }

    async fn get_prompts(&self) -> Result<Vec<AgentPrompt>> {
        self.backend().get_prompts().await
    }

    async fn save_prompt(&self, prompt: AgentPrompt) -> Result<AgentPrompt> {
        self.backend().save_prompt(prompt).await
    }

    async fn delete_prompt(&self, id: i64) -> Result<()> {
        self.backend().delete_prompt(id).await
    }

    async fn setup(&self) -> Result<()> {
        self.backend().setup().await
    }

    async fn tear_down(&self) -> Result<()> {
        self.backend().tear_down().await
    }

    fn supports_stop_response(&self) -> bool {
        self.backend().supports_stop_response()
    }

    fn supports_transcriptions(&self) -> bool {
        self.backend().supports_transcriptions()
    }

    fn activates_on(&self, req: &RequestEvent) -> bool {
        self.backend().activates_on(req)
    }
}
