//! 將解碼後的伺服器事件轉換為型別化的 [`MessagePart`]。
//!
//! 每種方言各有一張「事件名稱 → 建構函式」對照表。獨立代理的未知事件以事件名稱
//! 為鍵保留為 `Custom`；平台代理的未知事件則記錄後略過。

use std::future::ready;
use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use log::debug;
use serde_json::Value;

use crate::agent::error::{ClientError, Result};
use crate::agent::message::{AgentFlow, MessagePart};

use super::AgentKind;
use super::http::sse::ServerSentEvent;
use super::http::{ResponseStream, StreamItem};

/// 惰性、單次走訪的訊息部分序列。
pub type PartStream = Pin<Box<dyn Stream<Item = Result<MessagePart>> + Send>>;

type PartConstructor = fn(&str) -> Result<MessagePart>;

const STANDALONE_PARTS: &[(&str, PartConstructor)] = &[
    ("message", text_part),
    ("messageId", message_id_part),
];

const PLATFORM_PARTS: &[(&str, PartConstructor)] = &[
    ("userMessage", user_message_part),
    ("message", text_part),
    ("messageId", message_id_part),
    ("metadata", metadata_part),
    ("status", status_part),
];

fn text_part(data: &str) -> Result<MessagePart> {
    Ok(MessagePart::Message(data.to_string()))
}

fn message_id_part(data: &str) -> Result<MessagePart> {
    data.trim()
        .parse()
        .map(MessagePart::MessageId)
        .map_err(|_| ClientError::InvalidResponse(format!("無效的訊息 id: {data}")))
}

fn user_message_part(data: &str) -> Result<MessagePart> {
    Ok(MessagePart::UserMessage(serde_json::from_str(data)?))
}

fn metadata_part(data: &str) -> Result<MessagePart> {
    Ok(MessagePart::Metadata(serde_json::from_str(data)?))
}

fn status_part(data: &str) -> Result<MessagePart> {
    Ok(MessagePart::Status(serde_json::from_str(data)?))
}

/// 對未列在對照表中的事件的處理方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnknownEvents {
    PassThrough,
    Ignore,
}

/// 某個方言的事件對照器。
#[derive(Debug, Clone, Copy)]
pub struct PartMapper {
    table: &'static [(&'static str, PartConstructor)],
    unknown: UnknownEvents,
}

impl PartMapper {
    pub fn for_kind(kind: AgentKind) -> Self {
        match kind {
            AgentKind::Standalone => Self {
                table: STANDALONE_PARTS,
                unknown: UnknownEvents::PassThrough,
            },
            AgentKind::Platform => Self {
                table: PLATFORM_PARTS,
                unknown: UnknownEvents::Ignore,
            },
        }
    }

    /// 轉換單一事件；被略過的事件回傳 `None`。
    pub fn map_event(&self, event: &ServerSentEvent) -> Result<Option<MessagePart>> {
        let name = event.name();
        if let Some((_, build)) = self.table.iter().find(|(event_name, _)| *event_name == name) {
            return build(&event.data).map(Some);
        }
        match self.unknown {
            UnknownEvents::PassThrough => {
                let data = serde_json::from_str(&event.data)?;
                Ok(Some(MessagePart::Custom {
                    event: name.to_string(),
                    data,
                }))
            }
            UnknownEvents::Ignore => {
                debug!("Ignoring unknown event {name}");
                Ok(None)
            }
        }
    }

    /// 非串流回應的 JSON：帶有 `steps` 時為執行紀錄，否則原樣保留。
    pub fn map_body(&self, body: Value) -> MessagePart {
        match AgentFlow::from_value(&body) {
            Some(flow) => MessagePart::Flow(flow),
            None => MessagePart::Body(body),
        }
    }

    pub fn map_item(&self, item: StreamItem) -> Result<Option<MessagePart>> {
        match item {
            StreamItem::Event(event) => self.map_event(&event),
            StreamItem::Body(body) => Ok(Some(self.map_body(body))),
        }
    }

    /// 將傳輸層的序列轉為訊息部分序列，保持到達順序。
    pub fn map_stream(self, items: ResponseStream) -> PartStream {
        Box::pin(items.filter_map(move |item| {
            ready(match item.and_then(|item| self.map_item(item)) {
                Ok(Some(part)) => Some(Ok(part)),
                Ok(None) => None,
                Err(err) => Some(Err(err)),
            })
        }))
    }
}
