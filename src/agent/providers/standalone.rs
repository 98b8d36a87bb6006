use std::future::ready;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::stream;
use log::{debug, info};
use reqwest::Method;
use serde_json::Value;

use crate::agent::error::Result;
use crate::agent::manifest::AgentManifest;
use crate::agent::message::{AgentPrompt, AgentSession};
use crate::agent::store::LocalPromptsRepository;

use super::http::models::{
    InteractionSummaryResponse, QuestionPayload, SessionPayload, TranscriptionPayload,
    TranscriptionResponse,
};
use super::http::{HttpTransport, RequestBody};
use super::mapper::{PartMapper, PartStream};
use super::{AgentBackend, AgentContext, AgentKind, AudioClip, Question};

/// 獨立部署、自行提供 sessions API 的代理。
///
/// 提示詞保存在本地儲存中。manifest 宣告 `auth` 時才附加該簽發者的 bearer token。
pub struct StandaloneAgent {
    url: String,
    logo: String,
    manifest: AgentManifest,
    transport: HttpTransport,
    authenticated: bool,
    prompts: LocalPromptsRepository,
}

impl StandaloneAgent {
    /// 圖示預設為 `{url}/logo.png`。
    pub fn new(url: impl Into<String>, manifest: AgentManifest, ctx: &AgentContext) -> Self {
        let url = url.into();
        let logo = format!("{url}/logo.png");
        Self::with_logo(url, manifest, logo, ctx)
    }

    pub fn with_logo(
        url: impl Into<String>,
        manifest: AgentManifest,
        logo: impl Into<String>,
        ctx: &AgentContext,
    ) -> Self {
        let transport = ctx.transport(manifest.auth.as_ref());
        Self {
            url: url.into(),
            logo: logo.into(),
            authenticated: manifest.auth.is_some(),
            manifest,
            transport,
            prompts: ctx.prompts.clone(),
        }
    }

    fn session_url(&self, session_id: &str) -> String {
        format!("{}/sessions/{}", self.url, session_id)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: Option<RequestBody>,
    ) -> Result<T> {
        self.transport
            .send_json(url, Method::POST, body, self.authenticated)
            .await
    }
}

#[async_trait]
impl AgentBackend for StandaloneAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Standalone
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

    async fn create_session(&self, locales: &[String]) -> Result<AgentSession> {
        if let Some(credentials) = self.transport.credentials() {
            credentials.login().await?;
        }
        let body = RequestBody::json(&SessionPayload { locales })?;
        self.post_json(&format!("{}/sessions", self.url), Some(body))
            .await
    }

    fn ask(&self, question: Question) -> PartStream {
        let body = match RequestBody::json(&QuestionPayload {
            question: &question.text,
        }) {
            Ok(body) => body,
            Err(err) => return Box::pin(stream::once(ready(Err(err)))),
        };
        let items = self.transport.streaming_send(
            format!("{}/questions", self.session_url(&question.session_id)),
            Method::POST,
            Some(body),
            self.authenticated,
        );
        PartMapper::for_kind(AgentKind::Standalone).map_stream(items)
    }

    async fn stop_response(&self, session_id: &str) -> Result<()> {
        self.transport
            .send_empty(
                &format!("{}/stop", self.session_url(session_id)),
                Method::POST,
                None,
                self.authenticated,
            )
            .await
    }

    /// 音訊以 data URL 形式放在 JSON 內送出。
    async fn transcribe_audio(&self, audio: AudioClip, session_id: &str) -> Result<String> {
        let file = format!(
            "data:{};base64,{}",
            audio.mime_type,
            STANDARD.encode(&audio.bytes)
        );
        let body = RequestBody::json(&TranscriptionPayload { file: &file })?;
        let response: TranscriptionResponse = self
            .post_json(
                &format!("{}/transcriptions", self.session_url(session_id)),
                Some(body),
            )
            .await?;
        response.into_text()
    }

    async fn solve_interaction_summary(&self, detail: Value, session_id: &str) -> Result<String> {
        let response: InteractionSummaryResponse = self
            .post_json(
                &format!("{}/interactions", self.session_url(session_id)),
                Some(RequestBody::Json(detail)),
            )
            .await?;
        Ok(response.summary)
    }

    async fn get_prompts(&self) -> Result<Vec<AgentPrompt>> {
        self.prompts.find_by_agent_id(&self.manifest.id).await
    }

    async fn save_prompt(&self, prompt: AgentPrompt) -> Result<AgentPrompt> {
        if prompt.id.is_none() {
            return self.prompts.insert_new(prompt, &self.manifest.id).await;
        }
        self.prompts.save(&prompt, &self.manifest.id).await?;
        Ok(prompt)
    }

    async fn delete_prompt(&self, id: i64) -> Result<()> {
        self.prompts
            .delete_by_id_and_agent_id(id, &self.manifest.id)
            .await
    }

    /// 沒有任何本地提示詞時，寫入 manifest 預設的提示詞。
    async fn setup(&self) -> Result<()> {
        let Some(seeded) = self.manifest.prompts.as_ref() else {
            return Ok(());
        };
        let prompts = (1..)
            .zip(seeded)
            .map(|(id, p)| AgentPrompt {
                id: Some(id),
                name: p.name.clone(),
                content: p.content.clone(),
                shared: true,
                can_edit: true,
                starter: p.starter,
            })
            .collect();
        if self.prompts.seed(prompts, &self.manifest.id).await? {
            info!("Seeded {} prompts for agent {}", seeded.len(), self.manifest.id);
        } else {
            debug!("Agent {} already has prompts, skipping seed", self.manifest.id);
        }
        Ok(())
    }

    async fn tear_down(&self) -> Result<()> {
        self.prompts.delete_by_agent_id(&self.manifest.id).await
    }
}
