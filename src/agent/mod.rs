//! 代理對話協定的用戶端。
//!
//! 此模組負責與代理後端溝通的核心組件，包括 manifest 與啟用規則、
//! 串流回答的訊息格式、對話狀態管理、代理註冊與兩種後端方言的實作。

// --- 子模組宣告 ---

/// `auth` 模組：憑證提供者介面，核心只向它索取 bearer token。
pub mod auth;

/// `config` 模組：負責定義用戶端設定，例如 `config/tero.toml` 的解析格式。
pub mod config;

/// `error` 模組：所有操作共用的錯誤類型。
pub mod error;

/// `manager` 模組：提供 `AgentRegistry`，負責代理的探索、註冊與移除。
pub mod manager;

/// `manifest` 模組：代理的靜態描述與瀏覽器請求的啟用規則。
pub mod manifest;

/// `message` 模組：定義串流回答的訊息部分 (`MessagePart`) 與對話訊息 (`ChatMessage`)。
pub mod message;

/// `providers` 模組：包含兩種代理方言（獨立代理、平台代理）的具體實作邏輯。
pub mod providers;

/// `session` 模組：管理對話狀態 (`Conversation`) 與分頁狀態 (`TabState`)。
pub mod session;

/// `store` 模組：本地鍵值儲存與提示詞儲存庫。
pub mod store;

// --- 公共 API 重新導出 ---

pub use auth::{
    CachedCredentialFactory, Credential, CredentialFactory, CredentialProvider,
    StaticCredentialFactory, StaticCredentials,
};
pub use config::ClientSettings;
pub use error::{ClientError, ErrorDisposition, Result};
pub use manager::AgentRegistry;
pub use manifest::{AgentManifest, AuthConfig, RequestEvent, RequestEventType};
pub use message::{AgentPrompt, AgentSession, ChatMessage, MessagePart};
pub use providers::{
    Agent, AgentBackend, AgentContext, AgentKind, AgentRecord, AudioClip, PartStream, Question,
};
pub use session::{Conversation, ConversationState, PendingAnswer, TabDisplayMode, TabSessions, TabState};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};
