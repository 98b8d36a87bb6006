//! 代理 manifest 與瀏覽器請求的啟用規則。

use std::sync::OnceLock;

use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// 代理支援停止回應的能力名稱。
pub const STOP_CAPABILITY: &str = "stop";
/// 代理支援語音轉文字的能力名稱。
pub const TRANSCRIPTS_CAPABILITY: &str = "transcripts";

/// 代理的靜態描述，從 `{url}/manifest.json` 取得一次後不再變動。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentManifest {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub welcome_message: Option<String>,
    /// 首次安裝時預先寫入的提示詞。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Vec<ManifestPrompt>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_session_close: Option<EndAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_http_request: Option<Vec<AgentRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interaction_period_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub contact_email: String,
}

impl AgentManifest {
    /// manifest 是否宣告了指定的能力。
    pub fn supports_capability(&self, capability: &str) -> bool {
        self.capabilities
            .as_ref()
            .is_some_and(|caps| caps.iter().any(|c| c == capability))
    }

    /// 第一條含有 `activate` 動作的規則。
    pub fn activation_rule(&self) -> Option<&AgentRule> {
        self.on_http_request
            .as_ref()?
            .iter()
            .find(|rule| rule.actions.iter().any(|action| action.activate.is_some()))
    }

    /// 代理是否應對此請求事件啟用。
    pub fn activates_on(&self, req: &RequestEvent) -> bool {
        self.activation_rule()
            .is_some_and(|rule| rule.condition.matches(req))
    }

    /// 所有條件符合此請求的規則動作，依規則順序攤平。
    pub fn find_matching_actions(&self, req: &RequestEvent) -> Vec<AgentRuleAction> {
        self.on_http_request
            .iter()
            .flatten()
            .filter(|rule| rule.condition.matches(req))
            .flat_map(|rule| rule.actions.iter().cloned())
            .collect()
    }
}

/// OAuth 設定。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    pub url: String,
    pub client_id: String,
    pub scope: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPrompt {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub starter: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRule {
    pub condition: AgentRuleCondition,
    #[serde(default)]
    pub actions: Vec<AgentRuleAction>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRuleCondition {
    pub url_regex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_methods: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<RequestEventType>,
    /// 第一次比對時編譯的 `url_regex`；無效的樣式快取為 `None`。
    #[serde(skip)]
    compiled: OnceLock<Option<Regex>>,
}

impl PartialEq for AgentRuleCondition {
    fn eq(&self, other: &Self) -> bool {
        self.url_regex == other.url_regex
            && self.request_methods == other.request_methods
            && self.resource_types == other.resource_types
            && self.event == other.event
    }
}

impl AgentRuleCondition {
    pub fn new(url_regex: impl Into<String>) -> Self {
        Self {
            url_regex: url_regex.into(),
            ..Self::default()
        }
    }

    fn url_pattern(&self) -> Option<&Regex> {
        self.compiled
            .get_or_init(|| match Regex::new(&self.url_regex) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    warn!("Invalid activation url regex {:?}: {err}", self.url_regex);
                    None
                }
            })
            .as_ref()
    }

    /// 檢查請求是否符合條件。未指定 `event` 時只符合 `onCompleted`。
    pub fn matches(&self, req: &RequestEvent) -> bool {
        let url_matches = self
            .url_pattern()
            .is_some_and(|regex| regex.is_match(&req.details.url));
        let method = req.details.method.to_lowercase();
        url_matches
            && self
                .request_methods
                .as_ref()
                .is_none_or(|methods| methods.iter().any(|m| m == &method))
            && self
                .resource_types
                .as_ref()
                .is_none_or(|types| types.iter().any(|t| t == &req.details.resource_type))
            && self.event.unwrap_or(RequestEventType::OnCompleted) == req.event
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRuleAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activate: Option<ActivationAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_header: Option<AddHeaderRuleAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_interaction: Option<RecordInteractionRuleAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_request: Option<HttpRequestAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndAction {
    pub http_request: HttpRequestAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequestAction {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddHeaderRuleAction {
    pub header: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordInteractionRuleAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_request: Option<HttpRequestAction>,
}

/// 瀏覽器 webRequest 的事件階段。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestEventType {
    #[serde(rename = "onBeforeRequest")]
    OnBeforeRequest,
    #[serde(rename = "onCompleted")]
    OnCompleted,
}

/// 瀏覽器攔截到的一個請求。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEvent {
    pub event: RequestEventType,
    pub details: RequestDetails,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDetails {
    pub url: String,
    pub method: String,
    /// 資源類型，例如 `xmlhttprequest`、`main_frame`。
    pub resource_type: String,
}

impl RequestEvent {
    pub fn new(
        event: RequestEventType,
        url: impl Into<String>,
        method: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            event,
            details: RequestDetails {
                url: url.into(),
                method: method.into(),
                resource_type: resource_type.into(),
            },
        }
    }
}
