//! WAMP v1 dialect codec: JSON arrays tagged by an integer type code in the
//! first slot. See the message table for exact shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

const WELCOME: i64 = 0;
const PREFIX: i64 = 1;
const CALL: i64 = 2;
const CALLRESULT: i64 = 3;
const CALLERROR: i64 = 4;
const SUBSCRIBE: i64 = 5;
const UNSUBSCRIBE: i64 = 6;
const PUBLISH: i64 = 7;
const EVENT: i64 = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum WampMessage {
    Welcome {
        session_id: String,
        protocol_version: i64,
        server_ident: String,
    },
    Prefix {
        prefix: String,
        uri: String,
    },
    Call {
        call_id: String,
        proc_uri: String,
        args: Vec<Value>,
    },
    CallResult {
        call_id: String,
        result: Value,
    },
    CallError {
        call_id: String,
        error_uri: String,
        description: String,
        details: Option<Value>,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        payload: Value,
    },
    Event {
        topic: String,
        payload: Value,
    },
}

impl WampMessage {
    pub fn to_json(&self) -> Value {
        match self {
            WampMessage::Welcome {
                session_id,
                protocol_version,
                server_ident,
            } => serde_json::json!([WELCOME, session_id, protocol_version, server_ident]),
            WampMessage::Prefix { prefix, uri } => serde_json::json!([PREFIX, prefix, uri]),
            WampMessage::Call {
                call_id,
                proc_uri,
                args,
            } => {
                let mut arr = vec![
                    Value::from(CALL),
                    Value::from(call_id.clone()),
                    Value::from(proc_uri.clone()),
                ];
                arr.extend(args.iter().cloned());
                Value::Array(arr)
            }
            WampMessage::CallResult { call_id, result } => {
                serde_json::json!([CALLRESULT, call_id, result])
            }
            WampMessage::CallError {
                call_id,
                error_uri,
                description,
                details,
            } => {
                let mut arr = vec![
                    Value::from(CALLERROR),
                    Value::from(call_id.clone()),
                    Value::from(error_uri.clone()),
                    Value::from(description.clone()),
                ];
                if let Some(details) = details {
                    arr.push(details.clone());
                }
                Value::Array(arr)
            }
            WampMessage::Subscribe { topic } => serde_json::json!([SUBSCRIBE, topic]),
            WampMessage::Unsubscribe { topic } => serde_json::json!([UNSUBSCRIBE, topic]),
            WampMessage::Publish { topic, payload } => {
                serde_json::json!([PUBLISH, topic, payload])
            }
            WampMessage::Event { topic, payload } => serde_json::json!([EVENT, topic, payload]),
        }
    }

    pub fn serialize(&self) -> String {
        self.to_json().to_string()
    }

    pub fn parse(text: &str) -> Result<Self, BridgeError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|err| BridgeError::SessionProtocol(format!("invalid json: {err}")))?;
        Self::from_json(value)
    }

    pub fn from_json(value: Value) -> Result<Self, BridgeError> {
        let arr = value
            .as_array()
            .ok_or_else(|| BridgeError::SessionProtocol("message is not a json array".into()))?;

        let type_code = arr
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| BridgeError::SessionProtocol("missing message type code".into()))?;

        let short = |n: usize| -> Result<(), BridgeError> {
            if arr.len() < n {
                Err(BridgeError::SessionProtocol(format!(
                    "expected at least {n} elements, got {}",
                    arr.len()
                )))
            } else {
                Ok(())
            }
        };
        let str_at = |i: usize| -> Result<String, BridgeError> {
            arr.get(i)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| BridgeError::SessionProtocol(format!("expected string at index {i}")))
        };

        match type_code {
            WELCOME => {
                short(4)?;
                Ok(WampMessage::Welcome {
                    session_id: str_at(1)?,
                    protocol_version: arr[2].as_i64().unwrap_or(1),
                    server_ident: str_at(3)?,
                })
            }
            PREFIX => {
                short(3)?;
                Ok(WampMessage::Prefix {
                    prefix: str_at(1)?,
                    uri: str_at(2)?,
                })
            }
            CALL => {
                short(3)?;
                Ok(WampMessage::Call {
                    call_id: str_at(1)?,
                    proc_uri: str_at(2)?,
                    args: arr[3..].to_vec(),
                })
            }
            CALLRESULT => {
                short(3)?;
                Ok(WampMessage::CallResult {
                    call_id: str_at(1)?,
                    result: arr[2].clone(),
                })
            }
            CALLERROR => {
                short(4)?;
                Ok(WampMessage::CallError {
                    call_id: str_at(1)?,
                    error_uri: str_at(2)?,
                    description: str_at(3)?,
                    details: arr.get(4).cloned(),
                })
            }
            SUBSCRIBE => {
                short(2)?;
                Ok(WampMessage::Subscribe { topic: str_at(1)? })
            }
            UNSUBSCRIBE => {
                short(2)?;
                Ok(WampMessage::Unsubscribe { topic: str_at(1)? })
            }
            PUBLISH => {
                short(3)?;
                Ok(WampMessage::Publish {
                    topic: str_at(1)?,
                    payload: arr[2].clone(),
                })
            }
            EVENT => {
                short(3)?;
                Ok(WampMessage::Event {
                    topic: str_at(1)?,
                    payload: arr[2].clone(),
                })
            }
            other => Err(BridgeError::SessionProtocol(format!(
                "unknown wamp message type code {other}"
            ))),
        }
    }
}

/// CURIE-style `prefix:name` resolution. Splits once on the first `:`; if the
/// left side is a registered prefix, it is replaced with the full URI.
/// Unknown prefixes, or URIs without a colon, pass through unchanged.
pub fn resolve_uri(uri: &str, prefixes: &std::collections::HashMap<String, String>) -> String {
    match uri.split_once(':') {
        Some((short, rest)) => match prefixes.get(short) {
            Some(full) => format!("{full}{rest}"),
            None => uri.to_owned(),
        },
        None => uri.to_owned(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WampError {
    pub error_uri: String,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn welcome_round_trips() {
        let msg = WampMessage::Welcome {
            session_id: "abc".into(),
            protocol_version: 1,
            server_ident: "bridge".into(),
        };
        let serialized = msg.serialize();
        let parsed = WampMessage::parse(&serialized).unwrap();
        assert_eq!(msg, parsed);
    }

    #[test]
    fn call_round_trips_with_variadic_args() {
        let msg = WampMessage::Call {
            call_id: "c1".into(),
            proc_uri: "3dx_rpc:create".into(),
            args: vec![Value::from("3dconnexion:3dmouse"), Value::from("1.0")],
        };
        let parsed = WampMessage::parse(&msg.serialize()).unwrap();
        assert_eq!(msg, parsed);
    }

    #[test]
    fn callerror_round_trips_without_optional_details() {
        let msg = WampMessage::CallError {
            call_id: "c1".into(),
            error_uri: "wamp.error.not_found".into(),
            description: "not found".into(),
            details: None,
        };
        let parsed = WampMessage::parse(&msg.serialize()).unwrap();
        assert_eq!(msg, parsed);
    }

    #[test]
    fn resolves_registered_prefix() {
        let mut prefixes = HashMap::new();
        prefixes.insert("self".to_owned(), "wss://127.51.68.120/3dconnexion#".to_owned());
        assert_eq!(resolve_uri("self:update", &prefixes), "wss://127.51.68.120/3dconnexion#update");
    }

    #[test]
    fn unknown_prefix_passes_through() {
        let prefixes = HashMap::new();
        assert_eq!(resolve_uri("foo:bar", &prefixes), "foo:bar");
    }

    #[test]
    fn uri_without_colon_passes_through() {
        let prefixes = HashMap::new();
        assert_eq!(resolve_uri("no_colon_here", &prefixes), "no_colon_here");
    }

    #[test]
    fn rejects_short_array() {
        let err = WampMessage::parse("[2, \"c1\"]").unwrap_err();
        assert!(matches!(err, BridgeError::SessionProtocol(_)));
    }

    #[test]
    fn rejects_unknown_type_code() {
        let err = WampMessage::parse("[99]").unwrap_err();
        assert!(matches!(err, BridgeError::SessionProtocol(_)));
    }
}
