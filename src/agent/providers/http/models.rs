//! This module contains the request and response bodies exchanged with agent backends.
//！此模組包含與代理後端往來的請求和回應結構。

use crate::agent::error::{ClientError, Result};

// --- 獨立代理 ---
#[derive(serde::Serialize)]
pub struct SessionPayload<'a> {
    pub locales: &'a [String],
}

#[derive(serde::Serialize)]
pub struct QuestionPayload<'a> {
    pub question: &'a str,
}

#[derive(serde::Serialize)]
pub struct TranscriptionPayload<'a> {
    /// `data:<mime>;base64,<內容>` 形式的音訊。
    pub file: &'a str,
}

#[derive(serde::Deserialize)]
pub struct InteractionSummaryResponse {
    pub summary: String,
}

// --- 平台代理 ---
#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPayload {
    pub agent_id: i64,
}

/// `GET /api/agents?pinned=true` 回傳的代理摘要。
#[derive(serde::Deserialize, Debug, Clone)]
pub struct PlatformAgentSummary {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    /// base64 編碼的 PNG 圖示。
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub team: Option<serde_json::Value>,
}

#[derive(serde::Deserialize)]
pub struct CreatedPrompt {
    pub id: i64,
}

// --- 共用 ---
/// 兩種方言的語音轉文字回應欄位不同。
#[derive(serde::Deserialize)]
pub struct TranscriptionResponse {
    #[serde(default)]
    pub transcription: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

impl TranscriptionResponse {
    /// 取出轉錄文字；兩個欄位都沒有時視為無效回應。
    pub fn into_text(self) -> Result<String> {
        self.transcription.or(self.text).ok_or_else(|| {
            ClientError::InvalidResponse(String::from("轉錄回應缺少 transcription 或 text 欄位"))
        })
    }
}
