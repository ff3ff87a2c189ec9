//! Wire envelopes exchanged with the gateway.
//!
//! Outbound requests are a closed enum tagged by the `janus` field; the
//! transaction, session and handle ids are stamped on at send time. Inbound
//! envelopes are parsed into [`Envelope`], whose body is a closed
//! [`Inbound`] variant with an explicit `Unrecognized` case.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::SignalingError;

pub type SessionId = u64;
pub type HandleId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsepKind {
    Offer,
    Answer,
}

/// A session description as carried in the `jsep` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: JsepKind,
    pub sdp: String,
}

impl Jsep {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: JsepKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: JsepKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Payload of a `trickle` request. The gateway expects `{"completed": true}`
/// once local gathering has finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TrickleCandidate {
    Candidate(IceCandidate),
    Completed { completed: bool },
}

impl From<Option<IceCandidate>> for TrickleCandidate {
    fn from(candidate: Option<IceCandidate>) -> Self {
        match candidate {
            Some(candidate) => TrickleCandidate::Candidate(candidate),
            None => TrickleCandidate::Completed { completed: true },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum Request {
    Create,
    Attach {
        plugin: String,
    },
    Message {
        body: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        jsep: Option<Jsep>,
    },
    Trickle {
        candidate: TrickleCandidate,
    },
    Keepalive,
    Detach,
    Destroy,
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Create => "create",
            Request::Attach { .. } => "attach",
            Request::Message { .. } => "message",
            Request::Trickle { .. } => "trickle",
            Request::Keepalive => "keepalive",
            Request::Detach => "detach",
            Request::Destroy => "destroy",
        }
    }

    /// Whether a bare `ack` completes this request. Plugin messages are
    /// acked first and answered later by an `event` carrying the same
    /// transaction.
    pub fn completes_on_ack(&self) -> bool {
        matches!(self, Request::Trickle { .. } | Request::Keepalive)
    }

    pub fn to_frame(
        &self,
        transaction: &str,
        session_id: Option<SessionId>,
        handle_id: Option<HandleId>,
    ) -> Result<String, SignalingError> {
        let mut value = serde_json::to_value(self)
            .map_err(|err| SignalingError::Protocol(format!("encode {}: {err}", self.kind())))?;
        let Value::Object(map) = &mut value else {
            return Err(SignalingError::Protocol(format!(
                "request {} did not encode as an object",
                self.kind()
            )));
        };
        map.insert("transaction".into(), Value::String(transaction.to_string()));
        if let Some(id) = session_id {
            map.insert("session_id".into(), Value::from(id));
        }
        if let Some(id) = handle_id {
            map.insert("handle_id".into(), Value::from(id));
        }
        serde_json::to_string(&value)
            .map_err(|err| SignalingError::Protocol(format!("encode {}: {err}", self.kind())))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginData {
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayFault {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub reason: String,
}

impl From<GatewayFault> for SignalingError {
    fn from(fault: GatewayFault) -> Self {
        SignalingError::Gateway {
            code: fault.code,
            reason: fault.reason,
        }
    }
}

/// Body of an inbound envelope, one case per recognized `janus` kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Success {
        data: Option<Value>,
        plugindata: Option<PluginData>,
    },
    Ack,
    Error(GatewayFault),
    Event {
        plugindata: Option<PluginData>,
        jsep: Option<Jsep>,
    },
    WebrtcUp,
    Media {
        kind: Option<String>,
        receiving: bool,
    },
    SlowLink {
        uplink: bool,
    },
    Hangup {
        reason: Option<String>,
    },
    Detached,
    Timeout,
    Unrecognized {
        kind: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub transaction: Option<String>,
    pub session_id: Option<SessionId>,
    pub sender: Option<HandleId>,
    pub body: Inbound,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    janus: String,
    #[serde(default)]
    transaction: Option<String>,
    #[serde(default)]
    session_id: Option<SessionId>,
    #[serde(default)]
    sender: Option<HandleId>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    plugindata: Option<PluginData>,
    #[serde(default)]
    jsep: Option<Jsep>,
    #[serde(default)]
    error: Option<GatewayFault>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default, rename = "type")]
    media_type: Option<String>,
    #[serde(default)]
    receiving: Option<bool>,
    #[serde(default)]
    uplink: Option<bool>,
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, SignalingError> {
        let raw: RawEnvelope = serde_json::from_str(text)
            .map_err(|err| SignalingError::Protocol(format!("malformed envelope: {err}")))?;
        let body = match raw.janus.as_str() {
            "success" => Inbound::Success {
                data: raw.data,
                plugindata: raw.plugindata,
            },
            "ack" => Inbound::Ack,
            "error" => Inbound::Error(raw.error.unwrap_or(GatewayFault {
                code: 0,
                reason: "unspecified gateway error".into(),
            })),
            "event" => Inbound::Event {
                plugindata: raw.plugindata,
                jsep: raw.jsep,
            },
            "webrtcup" => Inbound::WebrtcUp,
            "media" => Inbound::Media {
                kind: raw.media_type,
                receiving: raw.receiving.unwrap_or(false),
            },
            "slowlink" => Inbound::SlowLink {
                uplink: raw.uplink.unwrap_or(false),
            },
            "hangup" => Inbound::Hangup { reason: raw.reason },
            "detached" => Inbound::Detached,
            "timeout" => Inbound::Timeout,
            other => Inbound::Unrecognized {
                kind: other.to_string(),
            },
        };
        Ok(Envelope {
            transaction: raw.transaction,
            session_id: raw.session_id,
            sender: raw.sender,
            body,
        })
    }

    /// The `data.id` of a `success` reply to `create` or `attach`.
    pub fn assigned_id(&self) -> Result<u64, SignalingError> {
        match &self.body {
            Inbound::Success { data: Some(data), .. } => data
                .get("id")
                .and_then(Value::as_u64)
                .ok_or_else(|| SignalingError::Protocol("success reply without data.id".into())),
            other => Err(SignalingError::Protocol(format!(
                "expected success reply with an id, got {other:?}"
            ))),
        }
    }
}

/// Reply of the plugin to a message: its `plugindata.data` plus any JSEP.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginReply {
    pub data: Value,
    pub jsep: Option<Jsep>,
}

impl PluginReply {
    pub fn from_envelope(envelope: Envelope) -> Result<Self, SignalingError> {
        let (plugindata, jsep) = match envelope.body {
            Inbound::Event { plugindata, jsep } => (plugindata, jsep),
            Inbound::Success { plugindata, .. } => (plugindata, None),
            other => {
                return Err(SignalingError::Protocol(format!(
                    "expected plugin reply, got {other:?}"
                )));
            }
        };
        let data = plugindata.map(|p| p.data).unwrap_or(Value::Null);
        if data.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(plugin_failure(&data));
        }
        Ok(PluginReply { data, jsep })
    }

    /// The `response` object the SFU plugin wraps successful replies in.
    pub fn response(&self) -> Option<&Value> {
        self.data.get("response")
    }
}

fn plugin_failure(data: &Value) -> SignalingError {
    let error = data.get("error");
    let code = error
        .and_then(|e| e.get("code"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let reason = match error {
        Some(Value::String(msg)) => msg.clone(),
        Some(Value::Object(obj)) => obj
            .get("msg")
            .or_else(|| obj.get("reason"))
            .and_then(Value::as_str)
            .unwrap_or("plugin request failed")
            .to_string(),
        _ => "plugin request failed".to_string(),
    };
    SignalingError::Gateway { code, reason }
}

/// Builds an empty JSON object, used as the body of a bare JSEP message.
pub(crate) fn empty_body() -> Value {
    Value::Object(Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_frame_carries_ids_and_jsep() {
        let request = Request::Message {
            body: json!({"kind": "join"}),
            jsep: Some(Jsep::offer("v=0")),
        };
        let frame = request.to_frame("t1", Some(7), Some(9)).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["janus"], "message");
        assert_eq!(value["transaction"], "t1");
        assert_eq!(value["session_id"], 7);
        assert_eq!(value["handle_id"], 9);
        assert_eq!(value["jsep"], json!({"type": "offer", "sdp": "v=0"}));
    }

    #[test]
    fn create_frame_omits_missing_ids() {
        let frame = Request::Create.to_frame("t2", None, None).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value, json!({"janus": "create", "transaction": "t2"}));
    }

    #[test]
    fn trickle_terminator_encodes_completed() {
        let request = Request::Trickle {
            candidate: TrickleCandidate::from(None),
        };
        let frame = request.to_frame("t3", Some(1), Some(2)).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["candidate"], json!({"completed": true}));

        let request = Request::Trickle {
            candidate: TrickleCandidate::from(Some(IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            })),
        };
        let frame = request.to_frame("t4", Some(1), Some(2)).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["candidate"]["sdpMid"], "0");
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn parses_success_with_assigned_id() {
        let envelope =
            Envelope::parse(r#"{"janus":"success","transaction":"a","data":{"id":4242}}"#)
                .unwrap();
        assert_eq!(envelope.transaction.as_deref(), Some("a"));
        assert_eq!(envelope.assigned_id().unwrap(), 4242);
    }

    #[test]
    fn parses_error_envelope() {
        let envelope = Envelope::parse(
            r#"{"janus":"error","transaction":"b",
                "error":{"code":458,"reason":"No such session"}}"#,
        )
        .unwrap();
        assert_eq!(
            envelope.body,
            Inbound::Error(GatewayFault {
                code: 458,
                reason: "No such session".into()
            })
        );
    }

    #[test]
    fn unknown_kind_is_reported_not_dropped() {
        let envelope = Envelope::parse(r#"{"janus":"trickle","sender":3}"#).unwrap();
        assert_eq!(
            envelope.body,
            Inbound::Unrecognized {
                kind: "trickle".into()
            }
        );
        assert_eq!(envelope.sender, Some(3));
    }

    #[test]
    fn plugin_reply_maps_failure_to_gateway_error() {
        let envelope = Envelope::parse(
            r#"{"janus":"event","transaction":"c","sender":1,
                "plugindata":{"plugin":"janus.plugin.sfu",
                    "data":{"success":false,"error":{"code":3,"msg":"room full"}}}}"#,
        )
        .unwrap();
        let err = PluginReply::from_envelope(envelope).unwrap_err();
        assert_eq!(
            err,
            SignalingError::Gateway {
                code: 3,
                reason: "room full".into()
            }
        );
    }

    #[test]
    fn plugin_reply_exposes_response_and_jsep() {
        let envelope = Envelope::parse(
            r#"{"janus":"event","transaction":"d","sender":1,
                "plugindata":{"plugin":"janus.plugin.sfu",
                    "data":{"success":true,"response":{"users":{"r":["a"]}}}},
                "jsep":{"type":"answer","sdp":"v=0"}}"#,
        )
        .unwrap();
        let reply = PluginReply::from_envelope(envelope).unwrap();
        assert_eq!(reply.response().unwrap()["users"]["r"][0], "a");
        assert_eq!(reply.jsep, Some(Jsep::answer("v=0")));
    }

    #[test]
    fn malformed_text_is_a_protocol_error() {
        let err = Envelope::parse("not json").unwrap_err();
        assert!(matches!(err, SignalingError::Protocol(_)));
    }
}
