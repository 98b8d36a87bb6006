use async_trait::async_trait;
use log::debug;
use reqwest::Method;
use reqwest::multipart::{Form, Part};
use serde_json::Value;

use crate::agent::error::{ClientError, Result};
use crate::agent::manifest::{AgentManifest, STOP_CAPABILITY, TRANSCRIPTS_CAPABILITY};
use crate::agent::message::{AgentPrompt, AgentSession};

use super::http::models::{CreatedPrompt, PlatformAgentSummary, ThreadPayload, TranscriptionResponse};
use super::http::{HttpTransport, RequestBody};
use super::mapper::{PartMapper, PartStream};
use super::{AgentBackend, AgentContext, AgentKind, AudioClip, Question};

/// 提問表單中代表使用者訊息的 `origin` 值。
const USER_ORIGIN: &str = "USER";

/// 平台伺服器上的單一代理，透過 threads API 對話。
///
/// 所有請求都以伺服器 manifest `auth` 對應的憑證授權。提示詞保存在伺服器端。
pub struct PlatformAgent {
    url: String,
    logo: String,
    manifest: AgentManifest,
    shared: bool,
    transport: HttpTransport,
}

impl PlatformAgent {
    pub fn new(
        url: impl Into<String>,
        manifest: AgentManifest,
        logo: impl Into<String>,
        shared: bool,
        ctx: &AgentContext,
    ) -> Self {
        Self {
            url: url.into(),
            logo: logo.into(),
            transport: ctx.transport(manifest.auth.as_ref()),
            manifest,
            shared,
        }
    }

    /// 由伺服器 manifest 與 `/api/agents` 的摘要展開成一個代理。
    ///
    /// id 為 `{伺服器 id}-{代理 id}`；沒有圖示時使用設定中的預設圖示。
    pub fn from_summary(
        summary: &PlatformAgentSummary,
        server_manifest: &AgentManifest,
        server_url: &str,
        ctx: &AgentContext,
    ) -> Self {
        let name = summary.name.clone().unwrap_or_default();
        let manifest = AgentManifest {
            id: format!("{}-{}", server_manifest.id, summary.id),
            welcome_message: Some(format!("Welcome to {name}")),
            name: Some(name),
            auth: server_manifest.auth.clone(),
            contact_email: server_manifest.contact_email.clone(),
            capabilities: Some(vec![
                STOP_CAPABILITY.to_string(),
                TRANSCRIPTS_CAPABILITY.to_string(),
            ]),
            ..AgentManifest::default()
        };
        let logo = match &summary.icon {
            Some(icon) if !icon.is_empty() => format!("data:image/png;base64,{icon}"),
            _ => ctx.settings.default_agent_icon.clone(),
        };
        Self::new(server_url, manifest, logo, summary.team.is_some(), ctx)
    }

    /// 代理是否屬於某個團隊。
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// 伺服器上的數字 id，取自 manifest id 最後一段。
    pub fn agent_id(&self) -> Result<i64> {
        let raw = self.manifest.id.rsplit('-').next().unwrap_or_default();
        raw.parse().map_err(|_| {
            ClientError::InvalidResponse(format!("無法從 {} 取得代理 id", self.manifest.id))
        })
    }

    fn thread_url(&self, thread_id: &str) -> String {
        format!("{}/api/threads/{}", self.url, thread_id)
    }

    fn prompts_url(&self) -> Result<String> {
        Ok(format!("{}/api/agents/{}/prompts", self.url, self.agent_id()?))
    }

    fn question_form(question: &Question) -> Form {
        let form = Form::new()
            .text("text", question.text.clone())
            .text("origin", USER_ORIGIN);
        match question.parent_message_id {
            Some(parent) => form.text("parentMessageId", parent.to_string()),
            None => form,
        }
    }
}

#[async_trait]
impl AgentBackend for PlatformAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Platform
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn logo(&self) -> &str {
        &self.logo
    }

    fn manifest(&self) -> &AgentManifest {
        &self.manifest
    }

    async fn create_session(&self, _locales: &[String]) -> Result<AgentSession> {
        let body = RequestBody::json(&ThreadPayload {
            agent_id: self.agent_id()?,
        })?;
        self.transport
            .send_json(&format!("{}/api/threads", self.url), Method::POST, Some(body), true)
            .await
    }

    fn ask(&self, question: Question) -> PartStream {
        let form = Self::question_form(&question);
        let items = self.transport.streaming_send(
            format!("{}/messages", self.thread_url(&question.session_id)),
            Method::POST,
            Some(RequestBody::Multipart(form)),
            true,
        );
        PartMapper::for_kind(AgentKind::Platform).map_stream(items)
    }

    async fn stop_response(&self, session_id: &str) -> Result<()> {
        self.transport
            .send_empty(
                &format!("{}/stop", self.thread_url(session_id)),
                Method::POST,
                None,
                true,
            )
            .await
    }

    /// 音訊以 `audio.webm` 檔案的 multipart 表單送出。
    async fn transcribe_audio(&self, audio: AudioClip, session_id: &str) -> Result<String> {
        let part = Part::bytes(audio.bytes)
            .file_name("audio.webm")
            .mime_str(&audio.mime_type)?;
        let form = Form::new().part("file", part);
        let response: TranscriptionResponse = self
            .transport
            .send_json(
                &format!("{}/transcriptions", self.thread_url(session_id)),
                Method::POST,
                Some(RequestBody::Multipart(form)),
                true,
            )
            .await?;
        response.into_text()
    }

    async fn solve_interaction_summary(&self, _detail: Value, _session_id: &str) -> Result<String> {
        Err(ClientError::unsupported("solve_interaction_summary", AgentKind::Platform.display_name()))
    }

    async fn get_prompts(&self) -> Result<Vec<AgentPrompt>> {
        self.transport
            .send_json(&self.prompts_url()?, Method::GET, None, true)
            .await
    }

    /// 已有 id 時以 PUT 更新，否則 POST 建立並採用伺服器指派的 id。
    async fn save_prompt(&self, mut prompt: AgentPrompt) -> Result<AgentPrompt> {
        let prompts_url = self.prompts_url()?;
        let body = RequestBody::json(&prompt)?;
        match prompt.id {
            Some(id) => {
                self.transport
                    .send_empty(&format!("{prompts_url}/{id}"), Method::PUT, Some(body), true)
                    .await?;
            }
            None => {
                let created: CreatedPrompt = self
                    .transport
                    .send_json(&prompts_url, Method::POST, Some(body), true)
                    .await?;
                debug!("Prompt {} created on {}", created.id, self.url);
                prompt.id = Some(created.id);
            }
        }
        Ok(prompt)
    }

    async fn delete_prompt(&self, id: i64) -> Result<()> {
        self.transport
            .send_empty(
                &format!("{}/{}", self.prompts_url()?, id),
                Method::DELETE,
                None,
                true,
            )
            .await
    }

    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn tear_down(&self) -> Result<()> {
        Ok(())
    }
}
