use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::multipart::Form;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::agent::auth::CredentialProvider;
use crate::agent::error::{ClientError, Result};

pub mod models;
pub mod sse;

use sse::{EventStreamDecoder, ServerSentEvent};

/// 串流回應的 Content-Type 前綴。
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// 伺服器以此事件名稱回報串流中途的錯誤。
const ERROR_EVENT: &str = "error";

/// 請求內容：JSON 或 multipart 表單。
pub enum RequestBody {
    Json(Value),
    Multipart(Form),
}

impl RequestBody {
    /// 序列化任意可轉為 JSON 的值。
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self> {
        Ok(RequestBody::Json(serde_json::to_value(value)?))
    }
}

/// 串流傳輸層產生的單位：一個伺服器事件，或非串流回應的完整 JSON。
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(ServerSentEvent),
    Body(Value),
}

/// 惰性、單次走訪的回應序列。
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<StreamItem>> + Send>>;

/// 負責發送 HTTP 請求、附加授權並檢查回應狀態的傳輸層。
///
/// 不會自動重試；重試策略由呼叫端決定。
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    credentials: Option<Arc<dyn CredentialProvider>>,
    headers: BTreeMap<String, String>,
}

impl HttpTransport {
    pub fn new(client: Client, credentials: Option<Arc<dyn CredentialProvider>>) -> Self {
        Self {
            client,
            credentials,
            headers: BTreeMap::new(),
        }
    }

    /// 附加到每個請求的額外標頭。
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn credentials(&self) -> Option<&Arc<dyn CredentialProvider>> {
        self.credentials.as_ref()
    }

    /// 建構請求標頭。token 在發送前一刻才取得，以容忍中途的 token 更新。
    async fn build_headers(&self, body: Option<&RequestBody>, auth_enabled: bool) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if matches!(body, Some(RequestBody::Json(_))) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        if auth_enabled && let Some(credentials) = &self.credentials {
            let value = credentials.bearer().await?;
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&value)
                    .map_err(|err| ClientError::InvalidResponse(format!("無效的授權標頭: {err}")))?,
            );
        }
        for (key, value) in self.headers.iter() {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                warn!("Skipping invalid extra header {key}");
                continue;
            };
            headers.insert(name, value);
        }
        Ok(headers)
    }

    /// 發送請求；非 2xx 回應轉為 `ClientError::Http`。
    pub async fn send(
        &self,
        url: &str,
        method: Method,
        body: Option<RequestBody>,
        auth_enabled: bool,
    ) -> Result<Response> {
        let headers = self.build_headers(body.as_ref(), auth_enabled).await?;
        debug!("{method} {url}");
        let mut request = self.client.request(method, url).headers(headers);
        request = match body {
            Some(RequestBody::Json(value)) => request.body(serde_json::to_string(&value)?),
            Some(RequestBody::Multipart(form)) => request.multipart(form),
            None => request,
        };
        check_response(request.send().await?).await
    }

    /// 發送請求並將回應解析為 JSON。
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        url: &str,
        method: Method,
        body: Option<RequestBody>,
        auth_enabled: bool,
    ) -> Result<T> {
        let response = self.send(url, method, body, auth_enabled).await?;
        Ok(response.json().await?)
    }

    /// 發送請求並忽略回應內容。
    pub async fn send_empty(
        &self,
        url: &str,
        method: Method,
        body: Option<RequestBody>,
        auth_enabled: bool,
    ) -> Result<()> {
        self.send(url, method, body, auth_enabled).await?;
        Ok(())
    }

    /// 產生惰性的回應序列；第一次輪詢時才發送請求。
    ///
    /// `text/event-stream` 回應逐一產生事件，讀取進度由消費端決定；其他回應解析為
    /// 單一 JSON。伺服器送出 `error` 事件時序列以 `ClientError::Http` 結束。
    /// 提前丟棄序列會一併釋放底層連線。
    pub fn streaming_send(
        &self,
        url: String,
        method: Method,
        body: Option<RequestBody>,
        auth_enabled: bool,
    ) -> ResponseStream {
        let transport = self.clone();
        Box::pin(async_stream::stream! {
            let response = match transport.send(&url, method, body, auth_enabled).await {
                Ok(response) => response,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            let status = response.status().as_u16();
            let is_stream = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.starts_with(EVENT_STREAM_CONTENT_TYPE));

            if !is_stream {
                yield response
                    .json::<Value>()
                    .await
                    .map(StreamItem::Body)
                    .map_err(ClientError::from);
                return;
            }

            let chunks = response.bytes_stream();
            futures_util::pin_mut!(chunks);
            let mut decoder = EventStreamDecoder::new();
            while let Some(chunk) = chunks.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield Err(ClientError::from(err));
                        return;
                    }
                };
                for event in decoder.push(&chunk) {
                    let item = check_event(event, status, &url);
                    let failed = item.is_err();
                    yield item;
                    if failed {
                        return;
                    }
                }
            }
            if let Some(event) = decoder.finish() {
                yield check_event(event, status, &url);
            }
            debug!("Event stream from {url} ended");
        })
    }
}

async fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Http {
        status: status.as_u16(),
        body,
    })
}

fn check_event(event: ServerSentEvent, status: u16, url: &str) -> Result<StreamItem> {
    if event.name() == ERROR_EVENT {
        warn!("Error event sent by server in response to {url}: {}", event.data);
        return Err(ClientError::Http {
            status,
            body: event.data,
        });
    }
    Ok(StreamItem::Event(event))
}
