//! MQTT Packet Decoder
//!
//! Streaming decoder for MQTT v3.1 and v3.1.1 frames.

use std::sync::Arc;

use bytes::Bytes;

use super::{
    read_binary, read_string, read_u16, read_utf8, read_variable_int, MAX_REMAINING_LENGTH,
};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PacketType, PubAck, Publish, QoS,
    SubAck, SubAckReturnCode, Subscribe, Subscription, UnsubAck, Unsubscribe, Will,
};

/// MQTT Packet Decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    /// Maximum remaining length accepted
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Decode a packet from the buffer
    ///
    /// Returns `Ok(None)` until a complete frame is buffered, then the packet
    /// and the number of bytes it occupied.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        // Checked before buffering the body so an oversized frame fails fast
        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge {
                size: remaining_length as usize,
                max: self.max_packet_size,
            });
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];
        let packet_type =
            PacketType::from_u8(packet_type).ok_or(DecodeError::InvalidPacketType(packet_type))?;

        let packet = self
            .decode_body(packet_type, flags, body)
            .map_err(|e| match e {
                // The frame is complete, so running out of bytes means the
                // lengths inside it lie.
                DecodeError::InsufficientData => DecodeError::MalformedPacket("truncated packet"),
                e => e,
            })?;

        Ok(Some((packet, total_len)))
    }

    fn decode_body(
        &self,
        packet_type: PacketType,
        flags: u8,
        body: &[u8],
    ) -> Result<Packet, DecodeError> {
        match packet_type {
            PacketType::Connect => self.decode_connect(flags, body),
            PacketType::ConnAck => self.decode_connack(flags, body),
            PacketType::Publish => self.decode_publish(flags, body),
            PacketType::PubAck => self.decode_puback(flags, body),
            PacketType::Subscribe => self.decode_subscribe(flags, body),
            PacketType::SubAck => self.decode_suback(flags, body),
            PacketType::Unsubscribe => self.decode_unsubscribe(flags, body),
            PacketType::UnsubAck => self.decode_unsuback(flags, body),
            PacketType::PingReq => {
                expect_flags(flags, 0)?;
                Ok(Packet::PingReq)
            }
            PacketType::PingResp => {
                expect_flags(flags, 0)?;
                Ok(Packet::PingResp)
            }
            PacketType::Disconnect => {
                expect_flags(flags, 0)?;
                Ok(Packet::Disconnect)
            }
            PacketType::PubRec | PacketType::PubRel | PacketType::PubComp | PacketType::Auth => {
                Ok(Packet::Unsupported(packet_type))
            }
        }
    }

    fn decode_connect(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        expect_flags(flags, 0)?;
        let mut pos = 0;

        let (protocol_name, len) = read_string(&payload[pos..])?;
        pos += len;

        let protocol_level = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;

        let mut connect = Connect {
            protocol_name: protocol_name.to_string(),
            protocol_level,
            client_id: String::new(),
            clean_session: false,
            keep_alive: 0,
            username: None,
            password: None,
            will: None,
        };

        // The rest of the layout is only known for the accepted levels; stop
        // here and let the gateway refuse the version with a CONNACK.
        if connect.protocol_version().is_none() {
            return Ok(Packet::Connect(Box::new(connect)));
        }

        let connect_flags = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;

        // Reserved bit must be 0
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let will_flag = (connect_flags & 0x04) != 0;
        let will_qos = (connect_flags >> 3) & 0x03;
        let will_retain = (connect_flags & 0x20) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        if will_qos > 2 {
            return Err(DecodeError::InvalidQoS(will_qos));
        }

        // If will flag is 0, will QoS and will retain must be 0
        if !will_flag && (will_qos != 0 || will_retain) {
            return Err(DecodeError::InvalidFlags);
        }

        connect.clean_session = (connect_flags & 0x02) != 0;
        connect.keep_alive = read_u16(&payload[pos..])?;
        pos += 2;

        let (client_id, len) = read_string(&payload[pos..])?;
        connect.client_id = client_id.to_string();
        pos += len;

        if will_flag {
            let (topic, len) = read_string(&payload[pos..])?;
            pos += len;
            let (will_payload, len) = read_binary(&payload[pos..])?;
            pos += len;

            connect.will = Some(Will {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(will_payload),
                qos: QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?,
                retain: will_retain,
            });
        }

        if username_flag {
            let (username, len) = read_string(&payload[pos..])?;
            connect.username = Some(username.to_string());
            pos += len;
        }

        // A password without a user name is surfaced rather than rejected so
        // the gateway can answer "bad username or password".
        if password_flag {
            let (password, _) = read_binary(&payload[pos..])?;
            connect.password = Some(Bytes::copy_from_slice(password));
        }

        Ok(Packet::Connect(Box::new(connect)))
    }

    fn decode_connack(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        expect_flags(flags, 0)?;

        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let acknowledge_flags = payload[0];
        if (acknowledge_flags & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let return_code = ConnectReturnCode::from_u8(payload[1])
            .ok_or(DecodeError::InvalidReturnCode(payload[1]))?;

        Ok(Packet::ConnAck(ConnAck {
            session_present: (acknowledge_flags & 0x01) != 0,
            return_code,
        }))
    }

    fn decode_publish(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let mut pos = 0;

        let (topic, len) = read_string(&payload[pos..])?;
        pos += len;

        // Topic names never carry wildcards; an empty name is left to the
        // gateway, which ignores it.
        if topic.contains('+') || topic.contains('#') {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&payload[pos..])?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id,
            payload: Bytes::copy_from_slice(&payload[pos..]),
        }))
    }

    fn decode_puback(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        expect_flags(flags, 0)?;
        Ok(Packet::PubAck(PubAck::new(read_u16(payload)?)))
    }

    fn decode_subscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        expect_flags(flags, 0x02)?;

        let packet_id = read_packet_id(payload)?;
        let mut pos = 2;

        let mut subscriptions = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_utf8(&payload[pos..])?;
            pos += len;

            let options = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
            pos += 1;

            // Upper six bits are reserved in v3.1.1
            if (options & 0xFC) != 0 {
                return Err(DecodeError::MalformedPacket(
                    "reserved subscription option bits set",
                ));
            }
            let qos = QoS::from_u8(options).ok_or(DecodeError::InvalidQoS(options))?;

            subscriptions.push(Subscription::new(filter, qos));
        }

        if subscriptions.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "SUBSCRIBE must have at least one topic",
            ));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
        }))
    }

    fn decode_suback(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        expect_flags(flags, 0)?;

        let packet_id = read_u16(payload)?;
        let return_codes = payload[2..]
            .iter()
            .map(|&code| SubAckReturnCode::from_u8(code).ok_or(DecodeError::InvalidReturnCode(code)))
            .collect::<Result<Vec<_>, _>>()?;

        if return_codes.is_empty() {
            return Err(DecodeError::MalformedPacket("SUBACK without return codes"));
        }

        Ok(Packet::SubAck(SubAck {
            packet_id,
            return_codes,
        }))
    }

    fn decode_unsubscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        expect_flags(flags, 0x02)?;

        let packet_id = read_packet_id(payload)?;
        let mut pos = 2;

        let mut filters = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;
            filters.push(filter.to_string());
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "UNSUBSCRIBE must have at least one topic",
            ));
        }

        Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
    }

    fn decode_unsuback(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        expect_flags(flags, 0)?;
        Ok(Packet::UnsubAck(UnsubAck {
            packet_id: read_u16(payload)?,
        }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn expect_flags(flags: u8, expected: u8) -> Result<(), DecodeError> {
    if flags != expected {
        return Err(DecodeError::InvalidFlags);
    }
    Ok(())
}

#[inline]
fn read_packet_id(payload: &[u8]) -> Result<u16, DecodeError> {
    let packet_id = read_u16(payload)?;
    if packet_id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }
    Ok(packet_id)
}
