//! Wire frames and JSON codecs
//!
//! Every frame is a JSON object with a `type` discriminator. Data frames use
//! any type ending in `_UPDATE`, plus whatever extra types a dialect names.

use crate::{
    data::{InboundEvent, Topic},
    error::ParseError,
};
use chrono::Utc;
use serde_json::{json, Map, Value};

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    ConnectionEstablished { message: Option<String> },
    Subscribed { topics: Vec<Topic> },
    Unsubscribed { topics: Vec<Topic> },
    Update(InboundEvent),
    Ping,
    Pong,
    Error { message: String },
    /// Unrecognised `type`; logged and ignored
    Unknown { kind: String },
}

/// Frame to send
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Subscribe(Vec<Topic>),
    Unsubscribe(Vec<Topic>),
    Ping,
    Pong,
    /// Application message passed through unchanged
    Custom(Value),
}

impl OutboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundFrame::Subscribe(_) => "SUBSCRIBE",
            OutboundFrame::Unsubscribe(_) => "UNSUBSCRIBE",
            OutboundFrame::Ping => "PING",
            OutboundFrame::Pong => "PONG",
            OutboundFrame::Custom(_) => "CUSTOM",
        }
    }
}

/// Encodes outbound frames and decodes inbound text
pub trait FrameCodec: Send + Sync {
    fn decode(&self, text: &str) -> Result<InboundFrame, ParseError>;
    fn encode(&self, frame: &OutboundFrame) -> Result<String, ParseError>;

    /// False when the endpoint itself selects the stream and the server
    /// neither expects SUBSCRIBE frames nor acknowledges them
    fn subscribes_in_band(&self) -> bool {
        true
    }
}

/// JSON codec with configurable field locations
#[derive(Debug, Clone)]
pub struct JsonFrameCodec {
    /// Key holding the topic list in SUBSCRIBE/SUBSCRIBED frames
    topics_key: String,
    /// JSON pointer to the topic of an update
    topic_pointer: String,
    /// JSON pointer to the payload of an update
    payload_pointer: String,
    /// Topic stamped on every update instead of reading `topic_pointer`
    room: Option<Topic>,
    /// Frame types decoded as updates besides `*_UPDATE`
    data_types: Vec<String>,
}

impl JsonFrameCodec {
    /// Generic dialect:
    /// `{"type":"X_UPDATE","topic":"..","id":"..","sequence":1,"payload":{..}}`
    pub fn new() -> Self {
        Self {
            topics_key: "topics".to_string(),
            topic_pointer: "/topic".to_string(),
            payload_pointer: "/payload".to_string(),
            room: None,
            data_types: Vec::new(),
        }
    }

    /// Stock ticker dialect: `stockCodes` lists, updates under `data.stockData`
    pub fn stock_ticker() -> Self {
        Self {
            topics_key: "stockCodes".to_string(),
            topic_pointer: "/data/stockData/stockCode".to_string(),
            payload_pointer: "/data/stockData".to_string(),
            room: None,
            data_types: Vec::new(),
        }
    }

    /// Region chat dialect: the socket URL selects the room, so every
    /// `CHAT`/`ENTER`/`LEAVE`/`WELCOME`/`USERS`/`TYPING` frame is an update
    /// on `room` carrying the whole frame as payload. Message ids are UUID
    /// strings; `TYPING` frames have none.
    pub fn region_chat(room: Topic) -> Self {
        Self {
            topics_key: "topics".to_string(),
            topic_pointer: String::new(),
            payload_pointer: String::new(),
            room: Some(room),
            data_types: ["CHAT", "ENTER", "LEAVE", "WELCOME", "USERS", "TYPING"]
                .iter()
                .map(|kind| kind.to_string())
                .collect(),
        }
    }

    /// Decode frames of type `kind` as updates
    pub fn with_data_type(mut self, kind: &str) -> Self {
        self.data_types.push(kind.to_string());
        self
    }

    fn is_data_type(&self, kind: &str) -> bool {
        kind.ends_with("_UPDATE") || self.data_types.iter().any(|known| known == kind)
    }

    pub fn with_topics_key(mut self, key: &str) -> Self {
        self.topics_key = key.to_string();
        self
    }

    pub fn with_topic_pointer(mut self, pointer: &str) -> Self {
        self.topic_pointer = pointer.to_string();
        self
    }

    pub fn with_payload_pointer(mut self, pointer: &str) -> Self {
        self.payload_pointer = pointer.to_string();
        self
    }

    /// Topic list of an ack, at the top level or under `data`
    fn extract_topics(&self, frame: &Value) -> Vec<Topic> {
        let list = frame
            .get(&self.topics_key)
            .or_else(|| frame.get("data").and_then(|d| d.get(&self.topics_key)));

        list.and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|key| Topic::new(key).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn decode_update(&self, kind: &str, frame: &Value) -> Result<InboundFrame, ParseError> {
        let topic = match &self.room {
            Some(room) => room.clone(),
            None => {
                let topic_key = frame
                    .pointer(&self.topic_pointer)
                    .and_then(Value::as_str)
                    .ok_or_else(|| ParseError::MissingField(format!("{} in {}", self.topic_pointer, kind)))?;
                Topic::new(topic_key).map_err(|e| ParseError::MalformedFrame(format!("{} carries {}", kind, e)))?
            }
        };

        let id = match frame.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        Ok(InboundFrame::Update(InboundEvent {
            id,
            topic,
            kind: kind.to_string(),
            sequence: frame.get("sequence").and_then(Value::as_u64),
            payload: frame.pointer(&self.payload_pointer).cloned().unwrap_or(Value::Null),
            received_at: Utc::now(),
        }))
    }
}

impl Default for JsonFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec for JsonFrameCodec {
    fn decode(&self, text: &str) -> Result<InboundFrame, ParseError> {
        let frame: Value = serde_json::from_str(text.trim())
            .map_err(|e| ParseError::MalformedFrame(format!("invalid JSON: {}", e)))?;

        let kind = frame
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::MissingField("type".to_string()))?;

        let message = || frame.get("message").and_then(Value::as_str).map(str::to_string);

        let decoded = match kind {
            "CONNECTION_ESTABLISHED" => InboundFrame::ConnectionEstablished { message: message() },
            "SUBSCRIBED" => InboundFrame::Subscribed {
                topics: self.extract_topics(&frame),
            },
            "UNSUBSCRIBED" => InboundFrame::Unsubscribed {
                topics: self.extract_topics(&frame),
            },
            "PING" => InboundFrame::Ping,
            "PONG" => InboundFrame::Pong,
            "ERROR" => InboundFrame::Error {
                message: message().unwrap_or_else(|| "unspecified server error".to_string()),
            },
            update if self.is_data_type(update) => self.decode_update(update, &frame)?,
            other => InboundFrame::Unknown {
                kind: other.to_string(),
            },
        };
        Ok(decoded)
    }

    fn encode(&self, frame: &OutboundFrame) -> Result<String, ParseError> {
        let value = match frame {
            OutboundFrame::Subscribe(topics) | OutboundFrame::Unsubscribe(topics) => {
                let mut object = Map::new();
                object.insert("type".to_string(), json!(frame.kind()));
                object.insert(self.topics_key.clone(), json!(topics));
                Value::Object(object)
            }
            OutboundFrame::Ping | OutboundFrame::Pong => json!({ "type": frame.kind() }),
            OutboundFrame::Custom(value) => value.clone(),
        };
        serde_json::to_string(&value).map_err(|e| ParseError::EncodeFailed(e.to_string()))
    }

    fn subscribes_in_band(&self) -> bool {
        self.room.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(keys: &[&str]) -> Vec<Topic> {
        keys.iter().map(|k| Topic::new(k).unwrap()).collect()
    }

    #[test]
    fn test_encode_batch_subscribe() {
        let codec = JsonFrameCodec::new();
        let text = codec.encode(&OutboundFrame::Subscribe(topics(&["AAPL", "MSFT"]))).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "SUBSCRIBE", "topics": ["AAPL", "MSFT"]}));
    }

    #[test]
    fn test_decode_update() {
        let codec = JsonFrameCodec::new();
        let frame = codec
            .decode(r#"{"type":"PRICE_UPDATE","topic":"AAPL","id":"evt-1","sequence":7,"payload":{"price":"187.2"}}"#)
            .unwrap();

        match frame {
            InboundFrame::Update(event) => {
                assert_eq!(event.topic.as_str(), "AAPL");
                assert_eq!(event.id.as_deref(), Some("evt-1"));
                assert_eq!(event.sequence, Some(7));
                assert_eq!(event.kind, "PRICE_UPDATE");
                assert_eq!(event.payload, json!({"price": "187.2"}));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_decode_acks_top_level_and_nested() {
        let codec = JsonFrameCodec::new();
        assert_eq!(
            codec.decode(r#"{"type":"SUBSCRIBED","topics":["AAPL"]}"#).unwrap(),
            InboundFrame::Subscribed { topics: topics(&["AAPL"]) }
        );
        assert_eq!(
            codec.decode(r#"{"type":"UNSUBSCRIBED","data":{"topics":["AAPL",""]}}"#).unwrap(),
            InboundFrame::Unsubscribed { topics: topics(&["AAPL"]) }
        );
    }

    #[test]
    fn test_stock_ticker_dialect() {
        let codec = JsonFrameCodec::stock_ticker();
        let text = codec.encode(&OutboundFrame::Subscribe(topics(&["005930"]))).unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&text).unwrap(),
            json!({"type": "SUBSCRIBE", "stockCodes": ["005930"]})
        );

        let ack = codec
            .decode(r#"{"type":"SUBSCRIBED","message":"ok","timestamp":1,"data":{"stockCodes":["005930"]}}"#)
            .unwrap();
        assert_eq!(ack, InboundFrame::Subscribed { topics: topics(&["005930"]) });

        let update = codec
            .decode(r#"{"type":"STOCK_UPDATE","data":{"stockData":{"stockCode":"005930","currentPrice":"71000"}}}"#)
            .unwrap();
        match update {
            InboundFrame::Update(event) => {
                assert_eq!(event.topic.as_str(), "005930");
                assert_eq!(event.payload["currentPrice"], json!("71000"));
                assert!(event.id.is_none());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_region_chat_dialect() {
        let room = Topic::new("region-11").unwrap();
        let codec = JsonFrameCodec::region_chat(room.clone());
        assert!(!codec.subscribes_in_band());

        let chat = codec
            .decode(r#"{"id":"9f1c","type":"CHAT","messageType":"CHAT","memberName":"kim","content":"hi","users":["kim","lee"]}"#)
            .unwrap();
        match chat {
            InboundFrame::Update(event) => {
                assert_eq!(event.topic, room);
                assert_eq!(event.id.as_deref(), Some("9f1c"));
                assert_eq!(event.kind, "CHAT");
                assert_eq!(event.payload["content"], json!("hi"));
                assert_eq!(event.payload["users"], json!(["kim", "lee"]));
            }
            other => panic!("unexpected frame {:?}", other),
        }

        for kind in ["ENTER", "LEAVE"] {
            let text = json!({"id": "a1", "type": kind, "content": "kim joined"}).to_string();
            assert!(matches!(codec.decode(&text).unwrap(), InboundFrame::Update(_)));
        }
        assert!(matches!(
            codec.decode(r#"{"type":"TYPING","memberName":"kim","isTyping":true}"#).unwrap(),
            InboundFrame::Update(InboundEvent { id: None, .. })
        ));
        assert_eq!(codec.decode(r#"{"type":"PONG"}"#).unwrap(), InboundFrame::Pong);
        assert!(JsonFrameCodec::new().subscribes_in_band());
    }

    #[test]
    fn test_malformed_and_unknown() {
        let codec = JsonFrameCodec::new();
        assert!(matches!(codec.decode("{not json"), Err(ParseError::MalformedFrame(_))));
        assert!(matches!(codec.decode(r#"{"topic":"AAPL"}"#), Err(ParseError::MissingField(_))));
        assert!(matches!(
            codec.decode(r#"{"type":"PRICE_UPDATE","payload":{}}"#),
            Err(ParseError::MissingField(_))
        ));
        assert_eq!(
            codec.decode(r#"{"type":"TYPING","isTyping":true}"#).unwrap(),
            InboundFrame::Unknown { kind: "TYPING".to_string() }
        );
    }

    #[test]
    fn test_error_frame() {
        let codec = JsonFrameCodec::new();
        assert_eq!(
            codec.decode(r#"{"type":"ERROR","message":"invalid stock code"}"#).unwrap(),
            InboundFrame::Error {
                message: "invalid stock code".to_string()
            }
        );
    }
}
