//! Control-channel protocol between peers and the master
//!
//! Every frame is one JSON object. Frames travel over a
//! [LengthDelimitedCodec] so the channel is message oriented, ordered and
//! reliable.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::errors::MembershipError;

/// Framed control connection, on either side
pub type ControlStream<T> = Framed<T, LengthDelimitedCodec>;

pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> ControlStream<T> {
    Framed::new(io, LengthDelimitedCodec::new())
}

/// Action-tagged messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// peer -> master, join the group
    Login {
        #[serde(default)]
        token: String,
        port: String,
    },

    /// master -> peer, the full member list after a change
    PeerUpdate { peers: String },

    /// peer -> master, telemetry record
    Log {
        #[serde(flatten)]
        data: Map<String, Value>,
    },

    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    pub fn login(token: impl Into<String>, port: u16) -> ControlMessage {
        ControlMessage::Login {
            token: token.into(),
            port: port.to_string(),
        }
    }

    pub fn peer_update(peers: &[String]) -> ControlMessage {
        ControlMessage::PeerUpdate {
            peers: join_peers(peers),
        }
    }
}

/// master -> peer, reply to a LOGIN. Carries no action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginReply {
    #[serde(rename = "self", default, skip_serializing_if = "Option::is_none")]
    pub self_name: Option<String>,
    #[serde(default)]
    pub peers: String,
    #[serde(default)]
    pub mirror: String,
}

impl LoginReply {
    pub fn new(self_name: String, peers: &[String], mirror: String) -> LoginReply {
        LoginReply {
            self_name: Some(self_name),
            peers: join_peers(peers),
            mirror,
        }
    }

    pub fn peer_list(&self) -> Vec<String> {
        split_peers(&self.peers)
    }
}

pub fn join_peers(peers: &[String]) -> String {
    peers.join(",")
}

/// Splits a comma-joined member list, skipping empty entries
pub fn split_peers(peers: &str) -> Vec<String> {
    peers
        .split(',')
        .map(str::trim)
        .filter(|peer| !peer.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, MembershipError> {
    let bytes = serde_json::to_vec(message)?;
    Ok(Bytes::from(bytes))
}

pub fn decode<'a, T: Deserialize<'a>>(frame: &'a [u8]) -> Result<T, MembershipError> {
    Ok(serde_json::from_slice(frame)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn login_wire_format() -> TestResult {
        let frame = encode(&ControlMessage::login("secret", 5000))?;
        let value: Value = serde_json::from_slice(&frame)?;
        assert_eq!(
            value,
            json!({"action": "LOGIN", "token": "secret", "port": "5000"})
        );

        let message: ControlMessage = decode(br#"{"action":"LOGIN","port":"6000"}"#)?;
        assert_eq!(
            message,
            ControlMessage::Login {
                token: "".to_string(),
                port: "6000".to_string()
            }
        );
        Ok(())
    }

    #[test]
    fn peer_update_wire_format() -> TestResult {
        let peers = vec![
            "http://10.0.0.1:5000".to_string(),
            "http://10.0.0.2:5000".to_string(),
        ];
        let frame = encode(&ControlMessage::peer_update(&peers))?;
        let value: Value = serde_json::from_slice(&frame)?;
        assert_eq!(
            value,
            json!({"action": "PEER_UPDATE", "peers": "http://10.0.0.1:5000,http://10.0.0.2:5000"})
        );
        Ok(())
    }

    #[test]
    fn log_strips_action_and_keeps_fields() -> TestResult {
        let message: ControlMessage =
            decode(br#"{"action":"LOG","key":"/logo.png","success":true}"#)?;
        let ControlMessage::Log { data } = message else {
            panic!("not a LOG message");
        };
        assert_eq!(data.get("key"), Some(&json!("/logo.png")));
        assert_eq!(data.get("success"), Some(&json!(true)));
        assert!(data.get("action").is_none());
        Ok(())
    }

    #[test]
    fn unknown_action() -> TestResult {
        let message: ControlMessage = decode(br#"{"action":"PING","x":1}"#)?;
        assert_eq!(message, ControlMessage::Unknown);

        let missing: Result<ControlMessage, _> = decode(br#"{"x":1}"#);
        assert!(matches!(missing, Err(MembershipError::Codec(_))));
        Ok(())
    }

    #[test]
    fn login_reply_without_self() -> TestResult {
        let reply: LoginReply = decode(br#"{"peers":"a,b","mirror":"http://origin/"}"#)?;
        assert_eq!(reply.self_name, None);
        assert_eq!(reply.peer_list(), vec!["a".to_string(), "b".to_string()]);

        let reply = LoginReply::new(
            "http://10.0.0.1:5000".to_string(),
            &["http://10.0.0.1:5000".to_string()],
            "http://origin.example/".to_string(),
        );
        let value: Value = serde_json::from_slice(&encode(&reply)?)?;
        assert_eq!(
            value,
            json!({
                "self": "http://10.0.0.1:5000",
                "peers": "http://10.0.0.1:5000",
                "mirror": "http://origin.example/"
            })
        );
        Ok(())
    }

    #[test]
    fn split_peers_skips_empty_entries() {
        assert!(split_peers("").is_empty());
        assert_eq!(split_peers("a,,b,"), vec!["a".to_string(), "b".to_string()]);
    }
}
