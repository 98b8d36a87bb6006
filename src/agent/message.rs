use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// 代理回答串流中的一個增量單位。
///
/// 每個部分只帶有一種內容；部分依到達順序套用到對話上。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessagePart {
    /// 伺服器回報已儲存的使用者訊息（平台方言）。
    UserMessage(UserMessageEcho),
    /// 一段回答文字。
    Message(String),
    /// 回答訊息的 id（獨立代理方言）。
    MessageId(i64),
    /// 結構化的多步驟執行紀錄。
    Flow(AgentFlow),
    /// 回答完成的資訊。
    Metadata(AnswerMetadata),
    /// 工具或步驟的進度更新。
    Status(StatusUpdate),
    /// 獨立代理送出的其他具名事件，以事件名稱為鍵保留 JSON 內容。
    Custom { event: String, data: Value },
    /// 非串流回應的完整 JSON 內容。
    Body(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessageEcho {
    pub id: i64,
    #[serde(default)]
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_message_id: Option<i64>,
    #[serde(default)]
    pub files: Vec<UploadedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes_saved: Option<i64>,
    #[serde(default)]
    pub stopped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StatusResult>,
}

/// 工具結果可能是一段文字或多行文字。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusResult {
    Text(String),
    Lines(Vec<String>),
}

/// 代理執行的步驟紀錄。
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentFlow {
    pub steps: Vec<FlowStep>,
}

impl AgentFlow {
    /// 含有 `steps` 欄位的 JSON 物件才是執行紀錄。
    pub fn from_value(value: &Value) -> Option<Self> {
        if value.get("steps").is_none() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlowStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub detail: Map<String, Value>,
}

/// 訊息附加的檔案。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageOrigin {
    User,
    Agent,
}

/// 對話中的一則訊息。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// 伺服器指派的 id，等待回應時為空。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub text: String,
    pub origin: MessageOrigin,
    pub is_complete: bool,
    pub is_success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<UploadedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes_saved: Option<i64>,
    #[serde(default)]
    pub stopped: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<StatusUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<AgentFlow>,
}

impl ChatMessage {
    fn new(text: String, origin: MessageOrigin, is_complete: bool, is_success: bool) -> Self {
        Self {
            id: None,
            text,
            origin,
            is_complete,
            is_success,
            children: Vec::new(),
            files: Vec::new(),
            minutes_saved: None,
            stopped: false,
            statuses: Vec::new(),
            flow: None,
        }
    }

    pub fn user_message(text: impl Into<String>) -> Self {
        Self::new(text.into(), MessageOrigin::User, true, true)
    }

    /// 沒有文字時代表仍在等待回答的代理訊息。
    pub fn agent_message(text: Option<String>) -> Self {
        let complete = text.is_some();
        Self::new(text.unwrap_or_default(), MessageOrigin::Agent, complete, true)
    }

    pub fn agent_error_message(text: impl Into<String>) -> Self {
        Self::new(text.into(), MessageOrigin::Agent, true, false)
    }

    pub fn is_user(&self) -> bool {
        self.origin == MessageOrigin::User
    }
}

/// 代理可重複使用的提示詞。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPrompt {
    /// 第一次儲存時指派。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub can_edit: bool,
    #[serde(default)]
    pub starter: bool,
}

impl AgentPrompt {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            content: content.into(),
            shared: false,
            can_edit: true,
            starter: false,
        }
    }
}

/// 後端建立對話時回傳的工作階段。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSession {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
}

/// 平台方言以數字作為 thread id，獨立代理則使用字串。
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}
