use std::collections::HashSet;

use log::{debug, info, warn};
use reqwest::Method;

use crate::agent::error::{ClientError, Result};
use crate::agent::manifest::{AgentManifest, RequestEvent};
use crate::agent::providers::http::models::PlatformAgentSummary;
use crate::agent::providers::{
    Agent, AgentBackend, AgentContext, AgentRecord, PlatformAgent, StandaloneAgent,
};

/// The key under which registered agents are persisted in the key-value store.
const AGENTS_KEY: &str = "agents";

/// The registry of agents the user has added.
///
/// `AgentRegistry` is responsible for:
/// - Discovering agents from a URL, either a single standalone agent or every pinned agent of a platform server.
/// - Rejecting agents whose manifest id is already registered.
/// - Running each agent's `setup` on registration and `tear_down` on removal.
/// - Persisting the registered agents through the key-value store.
pub struct AgentRegistry {
    ctx: AgentContext,
    agents: Vec<Agent>,
}

impl AgentRegistry {
    /// Creates an empty registry.
    pub fn new(ctx: AgentContext) -> Self {
        Self {
            ctx,
            agents: Vec::new(),
        }
    }

    /// Restores the registry from the agents previously saved in the store.
    pub async fn load(ctx: AgentContext) -> Result<Self> {
        let records: Vec<AgentRecord> = match ctx.store.get(AGENTS_KEY).await? {
            Some(value) => serde_json::from_value(value)?,
            None => Vec::new(),
        };
        let agents = records
            .into_iter()
            .map(|record| Agent::from_record(record, &ctx))
            .collect();
        Ok(Self { ctx, agents })
    }

    /// Writes every registered agent back to the store.
    pub async fn save(&self) -> Result<()> {
        let records: Vec<AgentRecord> = self.agents.iter().map(Agent::to_record).collect();
        self.ctx
            .store
            .set(AGENTS_KEY, serde_json::to_value(records)?)
            .await
    }

    /// Returns all registered agents in registration order.
    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn find_by_id(&self, id: &str) -> Option<&Agent> {
        self.agents.iter().find(|agent| agent.id() == id)
    }

    /// Returns the first agent whose activation rule matches the request.
    pub fn activated_by(&self, req: &RequestEvent) -> Option<&Agent> {
        self.agents.iter().find(|agent| agent.activates_on(req))
    }

    /// Fetches `{url}/manifest.json` without authentication.
    pub async fn find_manifest(&self, url: &str) -> Result<AgentManifest> {
        self.ctx
            .transport(None)
            .send_json(&format!("{url}/manifest.json"), Method::GET, None, false)
            .await
    }

    /// Resolves a URL into the agents it offers, without registering them.
    ///
    /// A manifest whose auth client id belongs to the platform (or one of its legacy aliases)
    /// identifies a platform server, which is expanded into one agent per pinned server agent.
    /// Any other manifest describes a single standalone agent.
    pub async fn discover(&self, url: &str) -> Result<Vec<Agent>> {
        let url = url.trim_end_matches('/');
        let manifest = self.find_manifest(url).await?;
        debug!("Manifest for {url}: {}", manifest.id);

        let Some(auth) = manifest
            .auth
            .as_ref()
            .filter(|auth| self.ctx.settings.is_platform_client(&auth.client_id))
        else {
            return Ok(vec![Agent::Standalone(StandaloneAgent::new(
                url, manifest, &self.ctx,
            ))]);
        };

        let transport = self.ctx.transport(Some(auth));
        if let Some(credentials) = transport.credentials() {
            credentials.login().await?;
        }
        let summaries: Vec<PlatformAgentSummary> = transport
            .send_json(&format!("{url}/api/agents?pinned=true"), Method::GET, None, true)
            .await?;
        info!("Platform server {url} offers {} pinned agents", summaries.len());
        Ok(summaries
            .iter()
            .map(|summary| {
                Agent::Platform(PlatformAgent::from_summary(summary, &manifest, url, &self.ctx))
            })
            .collect())
    }

    /// Discovers the agents behind a URL and registers them.
    ///
    /// Returns the ids of the newly registered agents.
    pub async fn add_from_url(&mut self, url: &str) -> Result<Vec<String>> {
        let agents = self.discover(url).await?;
        self.add(agents).await
    }

    /// Registers a batch of agents.
    ///
    /// If any agent duplicates a registered id (or another agent in the batch),
    /// the whole batch is rejected with `ClientError::ExistingAgent` before any `setup` runs.
    /// The batch is all-or-nothing: when a `setup` or the final save fails, the agents already
    /// set up are torn down again and the registry is left as it was.
    pub async fn add(&mut self, agents: Vec<Agent>) -> Result<Vec<String>> {
        let mut seen: HashSet<&str> = self.agents.iter().map(Agent::id).collect();
        for agent in &agents {
            if !seen.insert(agent.id()) {
                return Err(ClientError::ExistingAgent {
                    id: agent.id().to_string(),
                });
            }
        }

        for (index, agent) in agents.iter().enumerate() {
            if let Err(err) = agent.setup().await {
                warn!("Setup of agent {} failed: {err}", agent.id());
                Self::roll_back(&agents[..index]).await;
                return Err(err);
            }
        }

        let registered = self.agents.len();
        self.agents.extend(agents);
        if let Err(err) = self.save().await {
            let added: Vec<Agent> = self.agents.drain(registered..).collect();
            Self::roll_back(&added).await;
            return Err(err);
        }

        let added = &self.agents[registered..];
        for agent in added {
            info!("Registered {} agent {}", agent.kind().display_name(), agent.id());
        }
        Ok(added.iter().map(|agent| agent.id().to_string()).collect())
    }

    /// Undoes `setup` for agents of a batch that failed to register.
    async fn roll_back(agents: &[Agent]) {
        for agent in agents {
            if let Err(err) = agent.tear_down().await {
                warn!("Rolling back agent {} failed: {err}", agent.id());
            }
        }
    }

    /// Tears down and unregisters an agent.
    ///
    /// Returns `false` when no agent has the given id.
    pub async fn remove(&mut self, id: &str) -> Result<bool> {
        let Some(index) = self.agents.iter().position(|agent| agent.id() == id) else {
            return Ok(false);
        };
        self.agents[index].tear_down().await?;
        self.agents.remove(index);
        info!("Removed agent {id}");
        self.save().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::agent::auth::StaticCredentialFactory;
    use crate::agent::config::ClientSettings;
    use crate::agent::manifest::{ManifestPrompt, RequestEventType};
    use crate::agent::message::AgentPrompt;
    use crate::agent::providers::AgentKind;
    use crate::agent::store::{KeyValueStore, MemoryStore};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context(store: Arc<MemoryStore>) -> AgentContext {
        AgentContext::new(
            Arc::new(StaticCredentialFactory::new().with_issuer("https://login", "agents-hub", "tok")),
            store,
            ClientSettings::default(),
        )
    }

    async fn standalone_server(id: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": id,
                "contactEmail": "help@example.com",
                "prompts": [{"name": "Hi", "content": "Say hi", "starter": true}],
                "onHttpRequest": [{
                    "condition": {"urlRegex": "https://app\\.example\\.com/.*"},
                    "actions": [{"activate": {}}]
                }]
            })))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn standalone_url_registers_single_agent() {
        let server = standalone_server("helper").await;
        let store = Arc::new(MemoryStore::new());
        let mut registry = AgentRegistry::new(context(store.clone()));

        let ids = registry.add_from_url(&format!("{}/", server.uri())).await.unwrap();
        assert_eq!(ids, vec!["helper".to_string()]);

        let agent = registry.find_by_id("helper").unwrap();
        assert_eq!(agent.kind(), AgentKind::Standalone);
        assert_eq!(agent.url(), server.uri());
        assert_eq!(agent.get_prompts().await.unwrap().len(), 1);

        let saved = store.get(AGENTS_KEY).await.unwrap().unwrap();
        assert_eq!(saved[0]["type"], "agent");

        let req = RequestEvent::new(
            RequestEventType::OnCompleted,
            "https://app.example.com/page",
            "GET",
            "main_frame",
        );
        assert_eq!(registry.activated_by(&req).map(Agent::id), Some("helper"));
    }

    #[tokio::test]
    async fn duplicate_agent_is_rejected_without_side_effects() {
        let server = standalone_server("helper").await;
        let store = Arc::new(MemoryStore::new());
        let mut registry = AgentRegistry::new(context(store.clone()));
        registry.add_from_url(&server.uri()).await.unwrap();
        registry
            .find_by_id("helper")
            .unwrap()
            .save_prompt(AgentPrompt::new("Mine", "custom"))
            .await
            .unwrap();

        let err = registry.add_from_url(&server.uri()).await.unwrap_err();
        assert!(matches!(err, ClientError::ExistingAgent { ref id } if id == "helper"));
        assert_eq!(registry.agents().len(), 1);
        assert_eq!(
            registry.find_by_id("helper").unwrap().get_prompts().await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn platform_server_expands_pinned_agents() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "hub",
                "contactEmail": "team@example.com",
                "auth": {"url": "https://login", "clientId": "agents-hub", "scope": "openid"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/agents"))
            .and(query_param("pinned", "true"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1, "name": "Docs", "icon": "AAAA"},
                {"id": 2, "name": "Code", "team": {"id": 9}}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let mut registry = AgentRegistry::new(context(store.clone()));
        let ids = registry.add_from_url(&server.uri()).await.unwrap();
        assert_eq!(ids, vec!["hub-1".to_string(), "hub-2".to_string()]);
        assert!(registry.agents().iter().all(|a| a.kind() == AgentKind::Platform));

        let restored = AgentRegistry::load(context(store)).await.unwrap();
        let records: Vec<_> = restored.agents().iter().map(Agent::to_record).collect();
        assert_eq!(records[0].logo, "data:image/png;base64,AAAA");
        assert!(!records[0].shared);
        assert!(records[1].shared);
    }

    #[tokio::test]
    async fn remove_tears_down_local_prompts() {
        let server = standalone_server("helper").await;
        let store = Arc::new(MemoryStore::new());
        let mut registry = AgentRegistry::new(context(store.clone()));
        registry.add_from_url(&server.uri()).await.unwrap();

        assert!(registry.remove("helper").await.unwrap());
        assert!(!registry.remove("helper").await.unwrap());
        assert!(registry.agents().is_empty());
        assert_eq!(store.get("prompts").await.unwrap(), Some(json!({})));
        assert_eq!(store.get(AGENTS_KEY).await.unwrap(), Some(json!([])));
    }

    /// 寫入提示詞時一律失敗的儲存，用來讓 `setup` 出錯。
    struct ReadOnlyPrompts(MemoryStore);

    #[async_trait::async_trait]
    impl KeyValueStore for ReadOnlyPrompts {
        async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
            if key == "prompts" {
                return Err(ClientError::Io(std::io::Error::other("read-only")));
            }
            self.0.set(key, value).await
        }
    }

    #[tokio::test]
    async fn failed_setup_registers_nothing() {
        let store = Arc::new(ReadOnlyPrompts(MemoryStore::new()));
        let ctx = AgentContext::new(
            Arc::new(StaticCredentialFactory::new()),
            store.clone(),
            ClientSettings::default(),
        );
        let plain = AgentManifest {
            id: "plain".into(),
            ..AgentManifest::default()
        };
        let seeded = AgentManifest {
            id: "seeded".into(),
            prompts: Some(vec![ManifestPrompt {
                name: "Hi".into(),
                content: "Say hi".into(),
                starter: true,
            }]),
            ..AgentManifest::default()
        };
        let batch = vec![
            Agent::Standalone(StandaloneAgent::new("http://plain", plain, &ctx)),
            Agent::Standalone(StandaloneAgent::new("http://seeded", seeded, &ctx)),
        ];

        let mut registry = AgentRegistry::new(ctx);
        let err = registry.add(batch).await.unwrap_err();
        assert!(matches!(err, ClientError::Io(_)));
        assert!(registry.agents().is_empty());
        assert_eq!(store.get(AGENTS_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn manifest_fetch_failure_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let registry = AgentRegistry::new(context(Arc::new(MemoryStore::new())));
        let err = registry.discover(&server.uri()).await.unwrap_err();
        assert!(matches!(err, ClientError::Http { status: 404, .. }));
    }
}
