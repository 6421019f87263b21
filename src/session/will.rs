//! Last Will and Testament records

use std::sync::Arc;

use bytes::Bytes;

use super::PacketIdGenerator;
use crate::protocol::{Publish, QoS, Will};
use crate::topic::validate_topic_name;

/// Reasons a declared Will could not be armed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WillError {
    /// Only QoS 0 and 1 Wills are supported
    UnsupportedQoS(QoS),
    /// Will topic is not a valid topic name
    InvalidTopic(&'static str),
}

impl std::fmt::Display for WillError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WillError::UnsupportedQoS(qos) => write!(f, "unsupported will QoS {}", *qos as u8),
            WillError::InvalidTopic(e) => write!(f, "invalid will topic: {}", e),
        }
    }
}

impl std::error::Error for WillError {}

/// Will armed on a connection, owned by it until consumed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Stamped at capture for QoS 1 Wills
    pub packet_id: Option<u16>,
}

impl WillMessage {
    /// Build the Will record from the CONNECT declaration
    pub fn capture(will: Will, packet_ids: &PacketIdGenerator) -> Result<Self, WillError> {
        if will.qos == QoS::ExactlyOnce {
            return Err(WillError::UnsupportedQoS(will.qos));
        }
        validate_topic_name(&will.topic).map_err(WillError::InvalidTopic)?;

        let packet_id = match will.qos {
            QoS::AtMostOnce => None,
            _ => Some(packet_ids.next_id()),
        };

        Ok(Self {
            topic: Arc::from(will.topic),
            payload: will.payload,
            qos: will.qos,
            retain: will.retain,
            packet_id,
        })
    }

    /// Turn the Will into the PUBLISH replayed on an ungraceful close
    pub fn into_publish(self) -> Publish {
        Publish {
            dup: false,
            qos: self.qos,
            retain: self.retain,
            topic: self.topic,
            packet_id: self.packet_id,
            payload: self.payload,
        }
    }
}
