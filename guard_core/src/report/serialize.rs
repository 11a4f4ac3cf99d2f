use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Event, Sequence};

/// 攻击报告文件中的一行 JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SerializedEvent {
    #[serde(rename = "Type")]
    pub kind: String,
    pub time: DateTime<Utc>,
    pub flow: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hijack_seq: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hijack_ack: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Sequence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Sequence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap_start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap_end: Option<usize>,
}

impl SerializedEvent {
    /// 报告文件名使用的流字符串
    pub fn file_stem(&self) -> &str {
        &self.flow
    }
}

impl From<&Event> for SerializedEvent {
    fn from(event: &Event) -> Self {
        let mut serialized = SerializedEvent {
            kind: event.type_name().to_string(),
            time: event.time(),
            flow: event.flow().key().to_string(),
            hijack_seq: None,
            hijack_ack: None,
            payload: None,
            overlap: None,
            start: None,
            end: None,
            overlap_start: None,
            overlap_end: None,
        };
        match event {
            Event::Hijack(attack) => {
                serialized.hijack_seq = Some(attack.seq);
                serialized.hijack_ack = Some(attack.ack);
            }
            Event::Injection(attack) => {
                serialized.payload = Some(general_purpose::STANDARD.encode(&attack.payload));
                serialized.overlap = Some(general_purpose::STANDARD.encode(&attack.overlap));
                serialized.start = Some(attack.start);
                serialized.end = Some(attack.end);
                serialized.overlap_start = Some(attack.overlap_start);
                serialized.overlap_end = Some(attack.overlap_end);
            }
        }
        serialized
    }
}
