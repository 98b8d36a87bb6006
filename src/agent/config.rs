use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// 設定檔相對於根目錄的位置。
const CONFIG_FILE: &str = "config/tero.toml";

/// 代理用戶端的設定，通常從 `config/tero.toml` 載入。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// 平台自身的 OAuth client id；manifest 宣告此 id 時視為平台伺服器。
    #[serde(default = "default_platform_client_id")]
    pub platform_client_id: String,
    /// 尚未完全遷移的環境仍使用的舊 client id。
    #[serde(default = "default_legacy_client_ids")]
    pub legacy_client_ids: Vec<String>,
    /// 建立工作階段時傳給代理的語系。
    #[serde(default = "default_locales")]
    pub locales: Vec<String>,
    /// 平台代理沒有圖示時使用的預設圖示。
    #[serde(default = "default_agent_icon")]
    pub default_agent_icon: String,
    /// 本地提示詞儲存檔（JSON）。未指定時只保存在記憶體中。
    #[serde(default)]
    pub prompt_store_path: Option<PathBuf>,
    /// log4rs 的 YAML 設定檔。
    #[serde(default)]
    pub log_config: Option<PathBuf>,
    /// 附加到每個請求的額外 HTTP 標頭。
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
}

fn default_platform_client_id() -> String {
    String::from("tero")
}

fn default_legacy_client_ids() -> Vec<String> {
    vec![String::from("agents-hub")]
}

fn default_locales() -> Vec<String> {
    vec![String::from("en")]
}

fn default_agent_icon() -> String {
    String::from("/default-agent-icon.png")
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            platform_client_id: default_platform_client_id(),
            legacy_client_ids: default_legacy_client_ids(),
            locales: default_locales(),
            default_agent_icon: default_agent_icon(),
            prompt_store_path: None,
            log_config: None,
            extra_headers: BTreeMap::new(),
        }
    }
}

impl ClientSettings {
    /// 從指定的根目錄讀取設定。
    /// 如果 `config/tero.toml` 不存在，則回傳預設設定。
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&config_path)
            .with_context(|| format!("讀取用戶端設定失敗: {}", config_path.display()))?;
        let parsed: ClientSettings = toml::from_str(&raw)
            .with_context(|| format!("解析用戶端設定失敗: {}", config_path.display()))?;
        // 相對路徑以根目錄為基準。
        Ok(parsed.normalize(root))
    }

    fn normalize(mut self, root: &Path) -> Self {
        for path in [self.prompt_store_path.as_mut(), self.log_config.as_mut()]
            .into_iter()
            .flatten()
        {
            if path.is_relative() {
                *path = root.join(&path);
            }
        }
        self
    }

    /// 將目前設定寫入 `config/tero.toml`。
    pub fn save_to_file(&self, root: &Path) -> Result<()> {
        let config_dir = root.join("config");
        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("建立設定目錄失敗: {}", config_dir.display()))?;
        }
        let config_path = root.join(CONFIG_FILE);
        let serialized = toml::to_string_pretty(self).context("序列化用戶端設定失敗")?;
        fs::write(&config_path, serialized)
            .with_context(|| format!("寫入用戶端設定失敗: {}", config_path.display()))?;
        Ok(())
    }

    /// manifest 宣告的 client id 是否代表平台伺服器。
    pub fn is_platform_client(&self, client_id: &str) -> bool {
        client_id == self.platform_client_id
            || self.legacy_client_ids.iter().any(|id| id == client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ClientSettings::load(dir.path()).unwrap();
        assert_eq!(settings, ClientSettings::default());
        assert!(settings.is_platform_client("tero"));
        assert!(settings.is_platform_client("agents-hub"));
        assert!(!settings.is_platform_client("other"));
    }

    #[test]
    fn saved_settings_reload_with_absolute_paths() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ClientSettings {
            locales: vec!["es".into(), "en".into()],
            prompt_store_path: Some(PathBuf::from("data/prompts.json")),
            ..ClientSettings::default()
        };
        settings.save_to_file(dir.path()).unwrap();

        let loaded = ClientSettings::load(dir.path()).unwrap();
        assert_eq!(loaded.locales, vec!["es".to_string(), "en".to_string()]);
        assert_eq!(
            loaded.prompt_store_path,
            Some(dir.path().join("data/prompts.json"))
        );
        assert_eq!(loaded.log_config, None);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("config")).unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "platform_client_id = \"hub\"\n[extra_headers]\nx-team = \"core\"\n",
        )
        .unwrap();

        let loaded = ClientSettings::load(dir.path()).unwrap();
        assert_eq!(loaded.platform_client_id, "hub");
        assert_eq!(loaded.legacy_client_ids, vec!["agents-hub".to_string()]);
        assert_eq!(loaded.extra_headers.get("x-team").map(String::as_str), Some("core"));
    }

    #[test]
    fn invalid_toml_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("config")).unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "locales = 3").unwrap();
        let err = ClientSettings::load(dir.path()).unwrap_err();
        assert!(format!("{err}").contains("tero.toml"));
    }
}
