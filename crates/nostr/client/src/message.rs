//! Wire messages exchanged with relays.
//!
//! Outbound: `["REQ", id, filter...]`, `["EVENT", event]`, `["CLOSE", id]`.
//! Inbound: `EVENT`, `OK`, `EOSE`, `NOTICE`, `AUTH`, `CLOSED`.

use crate::error::{ClientError, Result};
use nostr::{Event, Filter};
use serde_json::{Value, json};

/// Message sent from client to relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Event(Event),
    Close(String),
}

impl ClientMessage {
    pub fn to_value(&self) -> Result<Value> {
        Ok(match self {
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = vec![json!("REQ"), json!(subscription_id)];
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
            Self::Event(event) => json!(["EVENT", event]),
            Self::Close(subscription_id) => json!(["CLOSE", subscription_id]),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }
}

/// Relay message received from a relay.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event(String, Event),
    Ok(String, bool, String),
    Eose(String),
    Notice(String),
    Auth(String),
    /// Relay ended a subscription on its own: `["CLOSED", id, reason]`.
    Closed(String, String),
}

/// Parse relay protocol JSON text message into typed relay message.
pub fn parse_relay_message(text: &str) -> Result<Option<RelayMessage>> {
    let value: Value = serde_json::from_str(text)?;
    let array = value
        .as_array()
        .ok_or_else(|| ClientError::Protocol("expected JSON array relay message".to_string()))?;
    if array.is_empty() {
        return Ok(None);
    }

    let kind = array[0]
        .as_str()
        .ok_or_else(|| ClientError::Protocol("missing relay message kind".to_string()))?;

    let string_at = |index: usize, what: &str| -> Result<String> {
        array
            .get(index)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::Protocol(format!("invalid {}", what)))
    };

    match kind {
        "EVENT" => {
            if array.len() < 3 {
                return Err(ClientError::Protocol("invalid EVENT message".to_string()));
            }
            let subscription_id = string_at(1, "EVENT subscription id")?;
            let event: Event = serde_json::from_value(array[2].clone()).map_err(|error| {
                ClientError::Protocol(format!("invalid EVENT payload: {}", error))
            })?;
            Ok(Some(RelayMessage::Event(subscription_id, event)))
        }
        "OK" => {
            if array.len() < 4 {
                return Err(ClientError::Protocol("invalid OK message".to_string()));
            }
            let event_id = string_at(1, "OK event id")?;
            let accepted = array[2]
                .as_bool()
                .ok_or_else(|| ClientError::Protocol("invalid OK accepted flag".to_string()))?;
            let message = string_at(3, "OK message text")?;
            Ok(Some(RelayMessage::Ok(event_id, accepted, message)))
        }
        "EOSE" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid EOSE message".to_string()));
            }
            Ok(Some(RelayMessage::Eose(string_at(1, "EOSE subscription id")?)))
        }
        "NOTICE" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid NOTICE message".to_string()));
            }
            Ok(Some(RelayMessage::Notice(string_at(1, "NOTICE message text")?)))
        }
        "AUTH" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid AUTH message".to_string()));
            }
            Ok(Some(RelayMessage::Auth(string_at(1, "AUTH challenge")?)))
        }
        "CLOSED" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid CLOSED message".to_string()));
            }
            let subscription_id = string_at(1, "CLOSED subscription id")?;
            let reason = array
                .get(2)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(Some(RelayMessage::Closed(subscription_id, reason)))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            id: "id".to_string(),
            pubkey: "pubkey".to_string(),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: "hello".to_string(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn encode_client_messages() -> Result<()> {
        let req = ClientMessage::Req {
            subscription_id: "sub".to_string(),
            filters: vec![Filter::new().kinds([1]), Filter::new().authors(["abc"])],
        };
        assert_eq!(
            req.to_value()?,
            json!(["REQ", "sub", {"kinds": [1]}, {"authors": ["abc"]}])
        );
        assert_eq!(
            ClientMessage::Close("sub".to_string()).to_json()?,
            r#"["CLOSE","sub"]"#
        );
        let event = ClientMessage::Event(sample_event()).to_value()?;
        assert_eq!(event[0], json!("EVENT"));
        assert_eq!(event[1]["id"], json!("id"));
        Ok(())
    }

    #[test]
    fn parse_known_message_kinds() -> Result<()> {
        let event_json = serde_json::to_string(&json!(["EVENT", "sub", sample_event()]))?;
        let parsed = parse_relay_message(&event_json)?.ok_or_else(|| {
            ClientError::Internal("expected parsed relay message, got None".to_string())
        })?;
        assert!(
            matches!(&parsed, RelayMessage::Event(id, event) if id == "sub" && *event == sample_event()),
            "unexpected {:?}",
            parsed
        );

        assert!(matches!(
            parse_relay_message(r#"["OK","event-id",false,"blocked: spam"]"#)?,
            Some(RelayMessage::Ok(id, false, message)) if id == "event-id" && message == "blocked: spam"
        ));
        assert!(matches!(
            parse_relay_message(r#"["EOSE","sub-2"]"#)?,
            Some(RelayMessage::Eose(id)) if id == "sub-2"
        ));
        assert!(matches!(
            parse_relay_message(r#"["NOTICE","maintenance"]"#)?,
            Some(RelayMessage::Notice(text)) if text == "maintenance"
        ));
        assert!(matches!(
            parse_relay_message(r#"["AUTH","challenge"]"#)?,
            Some(RelayMessage::Auth(text)) if text == "challenge"
        ));
        assert!(matches!(
            parse_relay_message(r#"["CLOSED","sub","error: too many subs"]"#)?,
            Some(RelayMessage::Closed(id, reason)) if id == "sub" && reason == "error: too many subs"
        ));
        assert!(matches!(
            parse_relay_message(r#"["CLOSED","sub"]"#)?,
            Some(RelayMessage::Closed(_, reason)) if reason.is_empty()
        ));
        Ok(())
    }

    #[test]
    fn parse_unknown_message_kind_returns_none() -> Result<()> {
        assert!(parse_relay_message(r#"["UNKNOWN","data"]"#)?.is_none());
        assert!(parse_relay_message("[]")?.is_none());
        Ok(())
    }

    #[test]
    fn parse_malformed_messages() {
        struct Case {
            name: &'static str,
            input: &'static str,
            expected_error_fragment: &'static str,
        }

        let cases = vec![
            Case {
                name: "non-array payload",
                input: r#"{"kind":"EVENT"}"#,
                expected_error_fragment: "expected JSON array relay message",
            },
            Case {
                name: "kind is not string",
                input: "[123]",
                expected_error_fragment: "missing relay message kind",
            },
            Case {
                name: "event too short",
                input: r#"["EVENT","sub"]"#,
                expected_error_fragment: "invalid EVENT message",
            },
            Case {
                name: "ok too short",
                input: r#"["OK","event-id",true]"#,
                expected_error_fragment: "invalid OK message",
            },
            Case {
                name: "closed too short",
                input: r#"["CLOSED"]"#,
                expected_error_fragment: "invalid CLOSED message",
            },
            Case {
                name: "event subscription id type",
                input: r#"["EVENT",123,{"id":"id"}]"#,
                expected_error_fragment: "invalid EVENT subscription id",
            },
            Case {
                name: "event payload shape",
                input: r#"["EVENT","sub",{"id":"id"}]"#,
                expected_error_fragment: "invalid EVENT payload",
            },
            Case {
                name: "ok accepted type",
                input: r#"["OK","event-id","yes","accepted"]"#,
                expected_error_fragment: "invalid OK accepted flag",
            },
            Case {
                name: "ok message text type",
                input: r#"["OK","event-id",true,42]"#,
                expected_error_fragment: "invalid OK message text",
            },
            Case {
                name: "notice text type",
                input: r#"["NOTICE",{"text":"msg"}]"#,
                expected_error_fragment: "invalid NOTICE message text",
            },
        ];

        for case in cases {
            let result = parse_relay_message(case.input);
            assert!(result.is_err(), "{}: expected an error", case.name);

            if let Err(error) = result {
                let rendered = error.to_string();
                assert!(
                    rendered.contains(case.expected_error_fragment),
                    "{}: expected error fragment '{}' in '{}'",
                    case.name,
                    case.expected_error_fragment,
                    rendered
                );
            }
        }
    }
}
