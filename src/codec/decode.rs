//! MQTT Packet Decoder
//!
//! Decodes MQTT v3.1 / v3.1.1 packets from a byte buffer.

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PacketType, ProtocolVersion, PubAck,
    PubComp, PubRec, PubRel, Publish, QoS, SubAck, SubAckReturnCode, Subscribe, SubscribeFilter,
    UnsubAck, Unsubscribe, Will,
};

/// MQTT Packet Decoder
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

    /// Decode one packet from the front of the buffer.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete packet,
    /// otherwise the packet and the number of bytes it occupied.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let type_bits = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let packet_type =
            PacketType::from_u8(type_bits).ok_or(DecodeError::InvalidPacketType(type_bits))?;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        if packet_type != PacketType::Publish && flags != packet_type.required_flags() {
            return Err(DecodeError::InvalidFlags);
        }

        let body = &buf[1 + len_bytes..total_len];

        // Inside a complete packet, running out of bytes means the packet lied
        // about its own structure.
        let packet = self
            .decode_body(packet_type, flags, body)
            .map_err(|e| match e {
                DecodeError::InsufficientData => {
                    DecodeError::MalformedPacket("remaining length too short")
                }
                other => other,
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
            PacketType::Connect => self.decode_connect(body),
            PacketType::ConnAck => self.decode_connack(body),
            PacketType::Publish => self.decode_publish(flags, body),
            PacketType::PubAck => Ok(Packet::PubAck(PubAck::new(read_packet_id(body)?))),
            PacketType::PubRec => Ok(Packet::PubRec(PubRec::new(read_packet_id(body)?))),
            PacketType::PubRel => Ok(Packet::PubRel(PubRel::new(read_packet_id(body)?))),
            PacketType::PubComp => Ok(Packet::PubComp(PubComp::new(read_packet_id(body)?))),
            PacketType::Subscribe => self.decode_subscribe(body),
            PacketType::SubAck => self.decode_suback(body),
            PacketType::Unsubscribe => self.decode_unsubscribe(body),
            PacketType::UnsubAck => Ok(Packet::UnsubAck(UnsubAck::new(read_packet_id(body)?))),
            PacketType::PingReq => expect_empty(body).map(|_| Packet::PingReq),
            PacketType::PingResp => expect_empty(body).map(|_| Packet::PingResp),
            PacketType::Disconnect => expect_empty(body).map(|_| Packet::Disconnect),
        }
    }

    fn decode_connect(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        let mut pos = 0;

        let (protocol_name, len) = read_string(payload)?;
        pos += len;

        if pos >= payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        let level = payload[pos];
        pos += 1;

        let protocol_version = match (protocol_name, level) {
            ("MQTT", 4) => ProtocolVersion::V311,
            ("MQIsdp", 3) => ProtocolVersion::V31,
            ("MQTT", other) | ("MQIsdp", other) => {
                return Err(DecodeError::UnsupportedProtocolVersion(other))
            }
            _ => return Err(DecodeError::InvalidProtocolName),
        };

        if pos >= payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        let connect_flags = payload[pos];
        pos += 1;

        // [MQTT-3.1.2-3] Reserved bit must be 0
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let clean_session = (connect_flags & 0x02) != 0;
        let will_flag = (connect_flags & 0x04) != 0;
        let will_qos_bits = (connect_flags >> 3) & 0x03;
        let will_retain = (connect_flags & 0x20) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        // [MQTT-3.1.2-22] If username flag is 0, password flag must be 0
        if !username_flag && password_flag {
            return Err(DecodeError::InvalidFlags);
        }

        let will_qos =
            QoS::from_u8(will_qos_bits).ok_or(DecodeError::InvalidQoS(will_qos_bits))?;

        // [MQTT-3.1.2-13] [MQTT-3.1.2-15] no will => will QoS and retain are 0
        if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(DecodeError::InvalidFlags);
        }

        let keep_alive = read_u16(&payload[pos..])?;
        pos += 2;

        let (client_id, len) = read_string(&payload[pos..])?;
        pos += len;

        let will = if will_flag {
            let (topic, len) = read_string(&payload[pos..])?;
            pos += len;

            let (will_payload, len) = read_binary(&payload[pos..])?;
            pos += len;

            Some(Will {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(will_payload),
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = if username_flag {
            let (s, len) = read_string(&payload[pos..])?;
            pos += len;
            Some(s.to_string())
        } else {
            None
        };

        let password = if password_flag {
            let (data, len) = read_binary(&payload[pos..])?;
            pos += len;
            Some(Bytes::copy_from_slice(data))
        } else {
            None
        };

        if pos != payload.len() {
            return Err(DecodeError::MalformedPacket("trailing bytes after CONNECT payload"));
        }

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version,
            client_id: client_id.to_string(),
            clean_session,
            keep_alive,
            username,
            password,
            will,
        })))
    }

    fn decode_connack(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        if payload.len() != 2 {
            return Err(DecodeError::MalformedPacket("CONNACK must be 2 bytes"));
        }

        // Only bit 0 is valid (session present), rest must be 0
        if (payload[0] & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let return_code = ConnectReturnCode::from_u8(payload[1])
            .ok_or(DecodeError::MalformedPacket("unknown CONNACK return code"))?;

        Ok(Packet::ConnAck(ConnAck {
            session_present: (payload[0] & 0x01) != 0,
            return_code,
        }))
    }

    fn decode_publish(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        // [MQTT-3.3.1-2] DUP must be 0 for QoS 0
        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let (topic, mut pos) = read_string(payload)?;

        // [MQTT-3.3.2-2] no wildcards in a topic name
        if topic.contains(['+', '#']) {
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

    fn decode_subscribe(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        let packet_id = read_nonzero_packet_id(payload)?;
        let mut pos = 2;

        let mut filters = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;

            if pos >= payload.len() {
                return Err(DecodeError::InsufficientData);
            }
            let options = payload[pos];
            pos += 1;

            // [MQTT-3.8.3-4] upper six bits are reserved
            if (options & 0xFC) != 0 {
                return Err(DecodeError::MalformedPacket("reserved subscription bits set"));
            }
            let qos = QoS::from_u8(options).ok_or(DecodeError::InvalidQoS(options))?;

            // Empty or malformed filters are reported per filter in SUBACK
            filters.push(SubscribeFilter::new(filter, qos));
        }

        // [MQTT-3.8.3-3] at least one topic filter
        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "SUBSCRIBE must have at least one topic",
            ));
        }

        Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
    }

    fn decode_suback(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        let packet_id = read_u16(payload)?;

        let return_codes = payload[2..]
            .iter()
            .map(|&code| {
                SubAckReturnCode::from_u8(code)
                    .ok_or(DecodeError::MalformedPacket("unknown SUBACK return code"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Packet::SubAck(SubAck {
            packet_id,
            return_codes,
        }))
    }

    fn decode_unsubscribe(&self, payload: &[u8]) -> Result<Packet, DecodeError> {
        let packet_id = read_nonzero_packet_id(payload)?;
        let mut pos = 2;

        let mut filters = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;
            filters.push(filter.to_string());
        }

        // [MQTT-3.10.3-2] at least one topic filter
        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "UNSUBSCRIBE must have at least one topic",
            ));
        }

        Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Body of the acknowledgement packets: exactly one packet identifier
fn read_packet_id(payload: &[u8]) -> Result<u16, DecodeError> {
    if payload.len() != 2 {
        return Err(DecodeError::MalformedPacket(
            "acknowledgement must carry only a packet id",
        ));
    }
    read_u16(payload)
}

fn read_nonzero_packet_id(payload: &[u8]) -> Result<u16, DecodeError> {
    let id = read_u16(payload)?;
    if id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }
    Ok(id)
}

fn expect_empty(payload: &[u8]) -> Result<(), DecodeError> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(DecodeError::MalformedPacket("packet must not have a payload"))
    }
}
