//! 代理用戶端的錯誤類型。

/// 代理用戶端在各層（傳輸、解碼、方言、註冊）可能回報的錯誤。
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// 伺服器回傳非 2xx 狀態，或串流中送出了 `error` 事件。
    #[error("Unexpected response received: {status} - {body}")]
    Http { status: u16, body: String },
    /// 探索代理時發現相同 manifest id 的代理已經註冊。
    #[error("Agent already exists: {id}")]
    ExistingAgent { id: String },
    /// 此方言沒有實作要求的能力。
    #[error("{operation} is not supported by {dialect} agents")]
    Unsupported {
        operation: &'static str,
        dialect: &'static str,
    },
    /// 憑證提供者沒有可用的使用者。
    #[error("No authenticated user available")]
    Unauthenticated,
    #[error(transparent)]
    Network(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// 伺服器回應的內容無法對應到預期的結構。
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// 呼叫端面對錯誤時應採取的處置方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// 401：需要重新登入。
    Reauthenticate,
    /// 403：顯示無權限畫面。
    Forbidden,
    /// 404：顯示找不到畫面。
    NotFound,
    /// 其他錯誤：顯示附帶聯絡方式的一般錯誤訊息。
    Generic,
}

impl ClientError {
    /// 依 HTTP 狀態碼將錯誤分類。
    pub fn disposition(&self) -> ErrorDisposition {
        match self {
            ClientError::Http { status: 401, .. } | ClientError::Unauthenticated => {
                ErrorDisposition::Reauthenticate
            }
            ClientError::Http { status: 403, .. } => ErrorDisposition::Forbidden,
            ClientError::Http { status: 404, .. } => ErrorDisposition::NotFound,
            _ => ErrorDisposition::Generic,
        }
    }

    pub(crate) fn unsupported(operation: &'static str, dialect: &'static str) -> Self {
        ClientError::Unsupported { operation, dialect }
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
