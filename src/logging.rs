//! 日誌初始化。
//!
//! 設定指定的 log4rs YAML 檔存在時使用 log4rs，否則退回 env_logger。

use log::{debug, warn};

use crate::agent::config::ClientSettings;

/// 實際接手日誌輸出的 logger。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerSource {
    /// 由設定中的 log4rs YAML 檔初始化。
    ConfigFile,
    /// 由 env_logger 初始化，可用 `RUST_LOG` 調整。
    Environment,
    /// 呼叫前已經有 logger，沿用既有的。
    Existing,
}

/// 初始化全域 logger。重複呼叫不會失敗。
///
/// 設定檔載入失敗時先裝上 env_logger，再透過它回報失敗原因。
pub fn init(settings: &ClientSettings) -> LoggerSource {
    let mut config_failure = None;
    if let Some(path) = settings.log_config.as_ref().filter(|path| path.exists()) {
        match log4rs::init_file(path, Default::default()) {
            Ok(()) => {
                debug!("Logging configured from {}", path.display());
                return LoggerSource::ConfigFile;
            }
            // 已經有 logger 時 log4rs 也會回報錯誤；此時沿用既有的 logger。
            Err(_) if log::max_level() != log::LevelFilter::Off => return LoggerSource::Existing,
            Err(err) => config_failure = Some(format!("{}: {err}", path.display())),
        }
    }

    let env = env_logger::Env::default().default_filter_or("info");
    let source = match env_logger::Builder::from_env(env).try_init() {
        Ok(()) => LoggerSource::Environment,
        Err(_) => {
            warn!("Logger already initialized, keeping the existing one");
            LoggerSource::Existing
        }
    };
    if let Some(failure) = config_failure {
        warn!("載入日誌設定失敗 {failure}");
    }
    source
}
