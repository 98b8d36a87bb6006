//! 單一對話與瀏覽器分頁的狀態。
//!
//! [`Conversation`] 持有訊息列表與進行中請求的簿記：同一時間最多只有一個回答在接收，
//! 新的發送會先請求停止舊的回答，舊回答之後到達的部分依世代編號丟棄。

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::{AbortHandle, Abortable};
use futures_util::{Stream, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::agent::error::{ClientError, Result};
use crate::agent::message::{AgentSession, ChatMessage, MessagePart};
use crate::agent::providers::{AgentBackend, AgentRecord, PartStream, Question};

/// 對話的狀態機。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Idle,
    AwaitingResponse,
    /// 伺服器確認停止後結束的回答。
    Stopped,
    /// 最近一次回答失敗；對話仍可繼續使用。
    Error,
}

/// 一次發送所產生的回答序列，帶有所屬的世代編號。
pub struct PendingAnswer {
    generation: u64,
    parts: Abortable<PartStream>,
}

impl PendingAnswer {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Stream for PendingAnswer {
    type Item = Result<MessagePart>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.parts).poll_next(cx)
    }
}

/// 目前接收中的回答在訊息列表中的位置。
#[derive(Debug, Clone, Copy)]
struct InFlight {
    user_index: usize,
    agent_index: usize,
}

/// 使用者與單一代理之間的對話。
pub struct Conversation {
    messages: Vec<ChatMessage>,
    session: Option<AgentSession>,
    locales: Vec<String>,
    state: ConversationState,
    generation: u64,
    in_flight: Option<InFlight>,
    abort: Option<AbortHandle>,
    stop_requested: bool,
    contact_email: Option<String>,
}

impl Conversation {
    pub fn new(locales: Vec<String>) -> Self {
        Self::restore(Vec::new(), locales)
    }

    /// 由保存的訊息列表重建對話。未完成的代理訊息視為已結束。
    pub fn restore(mut messages: Vec<ChatMessage>, locales: Vec<String>) -> Self {
        for message in messages.iter_mut().filter(|m| !m.is_complete) {
            message.is_complete = true;
        }
        Self {
            messages,
            session: None,
            locales,
            state: ConversationState::Idle,
            generation: 0,
            in_flight: None,
            abort: None,
            stop_requested: false,
            contact_email: None,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.id.as_str())
    }

    /// 目前世代；每次發送遞增。
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_awaiting_response(&self) -> bool {
        self.state == ConversationState::AwaitingResponse
    }

    /// 建立後端工作階段；已存在時直接沿用。
    pub async fn start(&mut self, agent: &dyn AgentBackend) -> Result<&str> {
        if self.session.is_none() {
            let session = agent.create_session(&self.locales).await?;
            debug!("Session {} created for agent {}", session.id, agent.manifest().id);
            self.session = Some(session);
        }
        Ok(self.session_id().unwrap_or_default())
    }

    /// 發送使用者訊息並回傳惰性的回答序列。
    ///
    /// 仍在等待上一個回答時，先向伺服器請求停止一次，再送出新的請求。
    pub async fn send(
        &mut self,
        agent: &dyn AgentBackend,
        text: impl Into<String>,
    ) -> Result<PendingAnswer> {
        if self.is_awaiting_response() {
            self.supersede(agent).await;
        }
        let session_id = self.start(agent).await?.to_string();
        let text = text.into();
        let parent_message_id = self.messages.iter().rev().find_map(|m| m.id);

        self.messages.push(ChatMessage::user_message(text.clone()));
        self.messages.push(ChatMessage::agent_message(None));
        self.in_flight = Some(InFlight {
            user_index: self.messages.len() - 2,
            agent_index: self.messages.len() - 1,
        });
        self.generation += 1;
        self.stop_requested = false;
        self.state = ConversationState::AwaitingResponse;
        self.contact_email = Some(agent.manifest().contact_email.clone()).filter(|e| !e.is_empty());

        let parts = agent.ask(Question {
            text,
            session_id,
            parent_message_id,
        });
        let (handle, registration) = AbortHandle::new_pair();
        self.abort = Some(handle);
        Ok(PendingAnswer {
            generation: self.generation,
            parts: Abortable::new(parts, registration),
        })
    }

    /// 請求伺服器停止目前的回答；序列會在伺服器結束後自然終止。
    pub async fn stop(&mut self, agent: &dyn AgentBackend) -> Result<()> {
        if !self.is_awaiting_response() {
            return Ok(());
        }
        if !agent.supports_stop_response() {
            return Err(ClientError::unsupported(
                "stop_response",
                agent.kind().display_name(),
            ));
        }
        if let Some(session_id) = self.session_id() {
            agent.stop_response(session_id).await?;
        }
        self.stop_requested = true;
        Ok(())
    }

    async fn supersede(&mut self, agent: &dyn AgentBackend) {
        info!("Superseding response {} before sending a new message", self.generation);
        if agent.supports_stop_response()
            && let Some(session_id) = self.session_id()
            && let Err(err) = agent.stop_response(session_id).await
        {
            warn!("Failed to stop superseded response: {err}");
        }
        if let Some(agent_message) = self.in_flight_agent_message() {
            agent_message.is_complete = true;
            agent_message.stopped = true;
        }
        self.in_flight = None;
        self.abort = None;
        self.state = ConversationState::Idle;
    }

    fn in_flight_agent_message(&mut self) -> Option<&mut ChatMessage> {
        let index = self.in_flight?.agent_index;
        self.messages.get_mut(index)
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.in_flight.is_some()
    }

    /// 依到達順序套用一個部分。屬於已被取代的回答時回傳 `false`。
    pub fn apply(&mut self, generation: u64, part: MessagePart) -> bool {
        if !self.is_current(generation) {
            debug!("Discarding part from superseded response {generation}");
            return false;
        }
        let Some(InFlight {
            user_index,
            agent_index,
        }) = self.in_flight
        else {
            return false;
        };
        if let MessagePart::UserMessage(echo) = part {
            if let Some(user) = self.messages.get_mut(user_index) {
                user.id = Some(echo.id);
                user.files = echo.files;
            }
            return true;
        }
        let Some(answer) = self.messages.get_mut(agent_index) else {
            return false;
        };
        match part {
            MessagePart::UserMessage(_) => {}
            MessagePart::Message(text) => answer.text.push_str(&text),
            MessagePart::MessageId(id) => answer.id = Some(id),
            MessagePart::Metadata(metadata) => {
                if metadata.answer_message_id.is_some() {
                    answer.id = metadata.answer_message_id;
                }
                answer.files = metadata.files;
                answer.minutes_saved = metadata.minutes_saved;
                answer.stopped = metadata.stopped;
            }
            MessagePart::Status(status) => answer.statuses.push(status),
            MessagePart::Flow(flow) => answer.flow = Some(flow),
            MessagePart::Custom { event, .. } => debug!("Unhandled {event} part"),
            MessagePart::Body(body) => match body {
                serde_json::Value::String(text) => answer.text.push_str(&text),
                other => answer.text.push_str(&other.to_string()),
            },
        }
        true
    }

    /// 回答序列正常結束。
    pub fn complete(&mut self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        let stop_requested = self.stop_requested;
        let stopped = match self.in_flight_agent_message() {
            Some(answer) => {
                answer.is_complete = true;
                answer.stopped |= stop_requested;
                answer.stopped
            }
            None => stop_requested,
        };
        self.finish(if stopped {
            ConversationState::Stopped
        } else {
            ConversationState::Idle
        });
    }

    /// 回答失敗：附加一則代理的錯誤訊息，對話回到可再次發送的狀態。
    pub fn fail(&mut self, generation: u64, err: &ClientError) {
        if !self.is_current(generation) {
            return;
        }
        warn!("Response {generation} failed: {err}");
        if let Some(InFlight { agent_index, .. }) = self.in_flight {
            let empty = self
                .messages
                .get(agent_index)
                .is_some_and(|answer| answer.text.is_empty());
            if empty {
                self.messages.remove(agent_index);
            } else if let Some(answer) = self.messages.get_mut(agent_index) {
                answer.is_complete = true;
            }
        }
        let text = failure_text(self.contact_email.as_deref());
        self.messages.push(ChatMessage::agent_error_message(text));
        self.finish(ConversationState::Error);
    }

    fn finish(&mut self, state: ConversationState) {
        self.in_flight = None;
        self.abort = None;
        self.stop_requested = false;
        self.state = state;
    }

    /// 依序讀取並套用整個回答。失敗時記錄錯誤訊息並回傳該錯誤。
    pub async fn receive(&mut self, answer: &mut PendingAnswer) -> Result<()> {
        let generation = answer.generation();
        while let Some(part) = answer.next().await {
            match part {
                Ok(part) => {
                    self.apply(generation, part);
                }
                Err(err) => {
                    self.fail(generation, &err);
                    return Err(err);
                }
            }
        }
        self.complete(generation);
        Ok(())
    }

    /// 放棄進行中的回答並停止接收；底層連線隨序列一起釋放。
    pub fn tear_down(&mut self) {
        if let Some(handle) = self.abort.take() {
            handle.abort();
        }
        if let Some(answer) = self.in_flight_agent_message() {
            answer.is_complete = true;
        }
        self.generation += 1;
        self.finish(ConversationState::Idle);
    }
}

fn failure_text(contact_email: Option<&str>) -> String {
    match contact_email {
        Some(email) => format!(
            "I could not process your request. Please try again and if the problem persists contact {email}."
        ),
        None => String::from("I could not process your request. Please try again."),
    }
}

/// 分頁側邊欄的顯示模式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TabDisplayMode {
    #[default]
    Full,
    Minimized,
    Closed,
}

/// 分頁狀態的保存格式。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabState {
    pub sidebar_size: u32,
    pub display_mode: TabDisplayMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentRecord>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

/// 一個分頁：顯示狀態加上它的對話。
pub struct TabSession {
    pub sidebar_size: u32,
    pub display_mode: TabDisplayMode,
    pub agent: Option<AgentRecord>,
    pub conversation: Conversation,
}

impl TabSession {
    pub fn from_state(state: TabState, locales: Vec<String>) -> Self {
        Self {
            sidebar_size: state.sidebar_size,
            display_mode: state.display_mode,
            agent: state.agent,
            conversation: Conversation::restore(state.messages, locales),
        }
    }

    pub fn to_state(&self) -> TabState {
        TabState {
            sidebar_size: self.sidebar_size,
            display_mode: self.display_mode,
            agent: self.agent.clone(),
            messages: self.conversation.messages().to_vec(),
        }
    }
}

/// 依分頁 id 管理各分頁的對話。
#[derive(Default)]
pub struct TabSessions {
    tabs: HashMap<i64, TabSession>,
}

impl TabSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, tab_id: i64, state: TabState, locales: Vec<String>) -> &mut TabSession {
        if let Some(mut previous) = self.tabs.remove(&tab_id) {
            previous.conversation.tear_down();
        }
        self.tabs
            .entry(tab_id)
            .or_insert(TabSession::from_state(state, locales))
    }

    pub fn get(&self, tab_id: i64) -> Option<&TabSession> {
        self.tabs.get(&tab_id)
    }

    pub fn get_mut(&mut self, tab_id: i64) -> Option<&mut TabSession> {
        self.tabs.get_mut(&tab_id)
    }

    /// 關閉分頁並中止進行中的回答，回傳最後的狀態以便保存。
    pub fn close(&mut self, tab_id: i64) -> Option<TabState> {
        let mut tab = self.tabs.remove(&tab_id)?;
        tab.conversation.tear_down();
        Some(tab.to_state())
    }

    /// 擴充功能卸載時關閉所有分頁。
    pub fn close_all(&mut self) -> Vec<(i64, TabState)> {
        let ids: Vec<i64> = self.tabs.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.close(id).map(|state| (id, state)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::agent::auth::StaticCredentialFactory;
    use crate::agent::config::ClientSettings;
    use crate::agent::manifest::AgentManifest;
    use crate::agent::message::{AnswerMetadata, MessageOrigin, UserMessageEcho};
    use crate::agent::providers::{AgentContext, StandaloneAgent};
    use crate::agent::store::MemoryStore;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn agent(url: &str, capabilities: &[&str]) -> StandaloneAgent {
        let ctx = AgentContext::new(
            Arc::new(StaticCredentialFactory::new()),
            Arc::new(MemoryStore::new()),
            ClientSettings::default(),
        );
        let manifest = AgentManifest {
            id: "helper".into(),
            contact_email: "help@example.com".into(),
            capabilities: Some(capabilities.iter().map(|c| c.to_string()).collect()),
            ..AgentManifest::default()
        };
        StandaloneAgent::new(url, manifest, &ctx)
    }

    async fn mount_session(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "s1"})))
            .mount(server)
            .await;
    }

    fn event_stream(body: &'static str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
    }

    #[tokio::test]
    async fn receive_builds_answer_and_returns_to_idle() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/sessions/s1/questions"))
            .respond_with(event_stream(
                "data: Hello\r\n\r\ndata:  world\r\n\r\nevent: messageId\r\ndata: 3\r\n\r\n",
            ))
            .mount(&server)
            .await;

        let agent = agent(&server.uri(), &[]);
        let mut conversation = Conversation::new(vec!["en".into()]);
        let mut answer = conversation.send(&agent, "hi").await.unwrap();
        assert!(conversation.is_awaiting_response());
        conversation.receive(&mut answer).await.unwrap();

        assert_eq!(conversation.state(), ConversationState::Idle);
        assert_eq!(conversation.session_id(), Some("s1"));
        let messages = conversation.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_user());
        assert_eq!(messages[1].text, "Hello world");
        assert_eq!(messages[1].id, Some(3));
        assert!(messages[1].is_complete);
    }

    #[tokio::test]
    async fn error_event_appends_failure_and_allows_resend() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/sessions/s1/questions"))
            .respond_with(event_stream("event: error\r\ndata: boom\r\n\r\n"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sessions/s1/questions"))
            .respond_with(event_stream("data: ok\r\n\r\n"))
            .mount(&server)
            .await;

        let agent = agent(&server.uri(), &[]);
        let mut conversation = Conversation::new(vec!["en".into()]);
        let mut answer = conversation.send(&agent, "first").await.unwrap();
        let err = conversation.receive(&mut answer).await.unwrap_err();
        assert!(matches!(err, ClientError::Http { ref body, .. } if body == "boom"));
        assert_eq!(conversation.state(), ConversationState::Error);

        let failure = conversation.messages().last().unwrap();
        assert!(!failure.is_success && failure.is_complete);
        assert!(failure.text.contains("help@example.com"));
        assert_eq!(conversation.messages().len(), 2);

        let mut answer = conversation.send(&agent, "second").await.unwrap();
        conversation.receive(&mut answer).await.unwrap();
        assert_eq!(conversation.state(), ConversationState::Idle);
        assert_eq!(conversation.messages().last().unwrap().text, "ok");
    }

    #[tokio::test]
    async fn superseding_send_stops_once_and_discards_stale_parts() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/sessions/s1/questions"))
            .respond_with(event_stream("data: answer\r\n\r\n"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sessions/s1/stop"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let agent = agent(&server.uri(), &["stop"]);
        let mut conversation = Conversation::new(vec!["en".into()]);
        let mut first = conversation.send(&agent, "one").await.unwrap();
        let part = first.next().await.unwrap().unwrap();
        assert!(conversation.apply(first.generation(), part));

        let mut second = conversation.send(&agent, "two").await.unwrap();
        assert_eq!(second.generation(), first.generation() + 1);

        conversation.receive(&mut first).await.unwrap();
        assert!(conversation.is_awaiting_response());
        conversation.receive(&mut second).await.unwrap();

        let texts: Vec<_> = conversation.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "answer", "two", "answer"]);
        assert!(conversation.messages()[1].stopped);
        assert_eq!(conversation.state(), ConversationState::Idle);

        let requests = server.received_requests().await.unwrap();
        let paths: Vec<_> = requests.iter().map(|r| r.url.path().to_string()).collect();
        assert_eq!(
            paths,
            vec![
                "/sessions",
                "/sessions/s1/questions",
                "/sessions/s1/stop",
                "/sessions/s1/questions"
            ]
        );
    }

    #[tokio::test]
    async fn stop_requires_capability() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/sessions/s1/questions"))
            .respond_with(event_stream("data: x\r\n\r\n"))
            .mount(&server)
            .await;

        let agent = agent(&server.uri(), &[]);
        let mut conversation = Conversation::new(vec!["en".into()]);
        let _answer = conversation.send(&agent, "q").await.unwrap();
        let err = conversation.stop(&agent).await.unwrap_err();
        assert!(matches!(err, ClientError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn explicit_stop_ends_in_stopped_state() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/sessions/s1/questions"))
            .respond_with(event_stream("data: partial\r\n\r\n"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sessions/s1/stop"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let agent = agent(&server.uri(), &["stop"]);
        let mut conversation = Conversation::new(vec!["en".into()]);
        let mut answer = conversation.send(&agent, "q").await.unwrap();
        conversation.stop(&agent).await.unwrap();
        conversation.receive(&mut answer).await.unwrap();
        assert_eq!(conversation.state(), ConversationState::Stopped);
        assert!(conversation.messages()[1].stopped);
    }

    #[tokio::test]
    async fn tear_down_aborts_outstanding_answer() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/sessions/s1/questions"))
            .respond_with(event_stream("data: never read\r\n\r\n"))
            .expect(0)
            .mount(&server)
            .await;

        let agent = agent(&server.uri(), &[]);
        let mut conversation = Conversation::new(vec!["en".into()]);
        let mut answer = conversation.send(&agent, "q").await.unwrap();
        conversation.tear_down();
        assert!(answer.next().await.is_none());
        assert_eq!(conversation.state(), ConversationState::Idle);
        assert!(!conversation.apply(answer.generation(), MessagePart::Message("late".into())));
    }

    #[test]
    fn parts_update_user_and_agent_messages() {
        let mut conversation = Conversation::new(vec![]);
        conversation.messages.push(ChatMessage::user_message("q"));
        conversation.messages.push(ChatMessage::agent_message(None));
        conversation.in_flight = Some(InFlight {
            user_index: 0,
            agent_index: 1,
        });
        conversation.generation = 1;
        conversation.state = ConversationState::AwaitingResponse;

        assert!(conversation.apply(1, MessagePart::UserMessage(UserMessageEcho { id: 10, files: vec![] })));
        conversation.apply(1, MessagePart::Message("a".into()));
        conversation.apply(
            1,
            MessagePart::Metadata(AnswerMetadata {
                answer_message_id: Some(11),
                files: vec![],
                minutes_saved: Some(5),
                stopped: false,
            }),
        );
        conversation.complete(1);

        let messages = conversation.messages();
        assert_eq!(messages[0].id, Some(10));
        assert_eq!(messages[1].id, Some(11));
        assert_eq!(messages[1].minutes_saved, Some(5));
        assert_eq!(messages[1].origin, MessageOrigin::Agent);
        assert_eq!(conversation.state(), ConversationState::Idle);
    }

    #[test]
    fn messages_round_trip_through_json() {
        let mut answer = ChatMessage::agent_message(Some("hello".into()));
        answer.id = Some(2);
        answer.children = vec![ChatMessage::user_message("branch")];
        let messages = vec![ChatMessage::user_message("hi"), answer];

        let raw = serde_json::to_string(&messages).unwrap();
        let restored: Vec<ChatMessage> = serde_json::from_str(&raw).unwrap();
        let conversation = Conversation::restore(restored, vec![]);
        assert_eq!(conversation.messages(), messages.as_slice());
    }

    #[test]
    fn closing_tab_returns_its_state() {
        let mut tabs = TabSessions::new();
        let state = TabState {
            sidebar_size: 420,
            display_mode: TabDisplayMode::Minimized,
            agent: None,
            messages: vec![ChatMessage::user_message("hi")],
        };
        tabs.open(7, state.clone(), vec!["en".into()]);
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs.get(7).unwrap().to_state(), state);

        let raw = serde_json::to_value(&state).unwrap();
        assert_eq!(raw["displayMode"], "minimized");
        assert_eq!(raw["sidebarSize"], 420);

        assert_eq!(tabs.close(7), Some(state));
        assert!(tabs.is_empty());
        assert_eq!(tabs.close(7), None);
    }
}
