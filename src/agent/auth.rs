//! 憑證提供者介面。
//!
//! 實際的 OAuth/OIDC 流程由外部負責；此處只定義核心在發送需要授權的請求前
//! 取得 bearer token 的方式。每個代理依自身 manifest 的 `auth` 區塊，
//! 透過 [`CredentialFactory`] 取得所屬簽發者的憑證，不同簽發者的 token 互不相通。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;

use crate::agent::error::{ClientError, Result};
use crate::agent::manifest::AuthConfig;

/// 已登入使用者的憑證。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }

    /// 產生 `Authorization` 標頭的值。
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

/// 由外部實作的憑證來源，負責自動更新 token 並序列化更新流程。
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// 取得目前使用者；token 過期時應先嘗試靜默更新，失敗則回傳 `None`。
    async fn get_user(&self) -> Result<Option<Credential>>;

    /// 啟動登入流程。
    async fn login(&self) -> Result<()>;

    /// 取得目前的 bearer token，沒有使用者時回傳 `Unauthenticated`。
    async fn bearer(&self) -> Result<String> {
        self.get_user()
            .await?
            .map(|user| user.bearer())
            .ok_or(ClientError::Unauthenticated)
    }
}

/// 持有固定 token 的憑證提供者，適合服務帳號或測試情境。
#[derive(Debug, Default)]
pub struct StaticCredentials {
    token: Mutex<Option<String>>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
        }
    }

    /// 沒有任何使用者的提供者。
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// 替換 token，模擬外部完成的更新。
    pub fn set_token(&self, token: Option<String>) {
        if let Ok(mut guard) = self.token.lock() {
            *guard = token;
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_user(&self) -> Result<Option<Credential>> {
        let token = self.token.lock().map(|guard| guard.clone()).unwrap_or(None);
        Ok(token.map(Credential::new))
    }

    async fn login(&self) -> Result<()> {
        Ok(())
    }
}

/// 簽發者的識別：登入網址與 client id。
type IssuerKey = (String, String);

fn issuer_key(auth: &AuthConfig) -> IssuerKey {
    (auth.url.clone(), auth.client_id.clone())
}

/// 依 manifest 的 `auth` 區塊提供對應簽發者的憑證。
pub trait CredentialFactory: Send + Sync {
    fn for_auth(&self, auth: &AuthConfig) -> Arc<dyn CredentialProvider>;
}

/// 每個簽發者各自持有固定 token 的工廠；未登記的簽發者得到匿名提供者。
#[derive(Debug, Default)]
pub struct StaticCredentialFactory {
    issuers: HashMap<IssuerKey, Arc<StaticCredentials>>,
}

impl StaticCredentialFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_issuer(
        mut self,
        url: impl Into<String>,
        client_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        self.issuers.insert(
            (url.into(), client_id.into()),
            Arc::new(StaticCredentials::new(token)),
        );
        self
    }
}

impl CredentialFactory for StaticCredentialFactory {
    fn for_auth(&self, auth: &AuthConfig) -> Arc<dyn CredentialProvider> {
        match self.issuers.get(&issuer_key(auth)) {
            Some(credentials) => credentials.clone(),
            None => Arc::new(StaticCredentials::anonymous()),
        }
    }
}

/// 每個簽發者只建立一次提供者，之後共用，讓同一簽發者的代理共享登入狀態。
pub struct CachedCredentialFactory<F> {
    build: F,
    providers: Mutex<HashMap<IssuerKey, Arc<dyn CredentialProvider>>>,
}

impl<F> CachedCredentialFactory<F>
where
    F: Fn(&AuthConfig) -> Arc<dyn CredentialProvider> + Send + Sync,
{
    pub fn new(build: F) -> Self {
        Self {
            build,
            providers: Mutex::new(HashMap::new()),
        }
    }
}

impl<F> CredentialFactory for CachedCredentialFactory<F>
where
    F: Fn(&AuthConfig) -> Arc<dyn CredentialProvider> + Send + Sync,
{
    fn for_auth(&self, auth: &AuthConfig) -> Arc<dyn CredentialProvider> {
        let Ok(mut providers) = self.providers.lock() else {
            return (self.build)(auth);
        };
        providers
            .entry(issuer_key(auth))
            .or_insert_with(|| {
                debug!("Creating credentials for {} at {}", auth.client_id, auth.url);
                (self.build)(auth)
            })
            .clone()
    }
}
