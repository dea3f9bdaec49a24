//! Codec tests against hand-assembled MQTT 3.1.1 frames

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use test_case::test_case;

use crate::codec::{read_variable_int, write_variable_int, Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolVersion, PubRel, Publish,
    QoS, SubAck, SubAckReturnCode, SubscribeFilter, Will,
};

// ============================================================================
// Helpers
// ============================================================================

fn encode(packet: &Packet) -> BytesMut {
    let mut buf = BytesMut::new();
    Encoder::new().encode(packet, &mut buf).unwrap();
    buf
}

fn decode(buf: &[u8]) -> Result<Packet, DecodeError> {
    match Decoder::new().decode(buf)? {
        Some((packet, consumed)) => {
            assert_eq!(consumed, buf.len());
            Ok(packet)
        }
        None => Err(DecodeError::InsufficientData),
    }
}

// ============================================================================
// Variable byte integer
// ============================================================================

#[test_case(0, &[0x00] ; "zero")]
#[test_case(127, &[0x7F] ; "one byte max")]
#[test_case(128, &[0x80, 0x01] ; "two byte min")]
#[test_case(16_383, &[0xFF, 0x7F] ; "two byte max")]
#[test_case(268_435_455, &[0xFF, 0xFF, 0xFF, 0x7F] ; "protocol max")]
fn test_variable_int(value: u32, bytes: &[u8]) {
    let mut buf = BytesMut::new();
    assert_eq!(write_variable_int(&mut buf, value).unwrap(), bytes.len());
    assert_eq!(&buf[..], bytes);
    assert_eq!(read_variable_int(bytes).unwrap(), (value, bytes.len()));
}

#[test]
fn test_variable_int_too_long() {
    assert_eq!(
        read_variable_int(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
        Err(DecodeError::InvalidRemainingLength)
    );
}

// ============================================================================
// CONNECT
// ============================================================================

#[test]
fn test_decode_connect_bytes() {
    #[rustfmt::skip]
    let frame = [
        0x10, 0x12,
        0x00, 0x04, b'M', b'Q', b'T', b'T',
        0x04,
        0x02,
        0x00, 0x3C,
        0x00, 0x06, b's', b'e', b'n', b's', b'o', b'r',
    ];

    let packet = decode(&frame).unwrap();
    assert_eq!(
        packet,
        Packet::Connect(Box::new(Connect {
            client_id: "sensor".into(),
            ..Default::default()
        }))
    );
}

#[test]
fn test_decode_connect_mqisdp() {
    #[rustfmt::skip]
    let frame = [
        0x10, 0x0F,
        0x00, 0x06, b'M', b'Q', b'I', b's', b'd', b'p',
        0x03,
        0x00,
        0x00, 0x0A,
        0x00, 0x01, b'a',
    ];

    match decode(&frame).unwrap() {
        Packet::Connect(c) => {
            assert_eq!(c.protocol_version, ProtocolVersion::V31);
            assert!(!c.clean_session);
            assert_eq!(c.keep_alive, 10);
        }
        other => panic!("expected CONNECT, got {:?}", other),
    }
}

#[test]
fn test_decode_connect_v5_unsupported() {
    #[rustfmt::skip]
    let frame = [
        0x10, 0x0C,
        0x00, 0x04, b'M', b'Q', b'T', b'T',
        0x05,
        0x02,
        0x00, 0x3C,
        0x00, 0x00,
    ];
    assert_eq!(decode(&frame), Err(DecodeError::UnsupportedProtocolVersion(5)));
}

#[test]
fn test_connect_with_will_and_credentials() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "dev-7".into(),
        clean_session: false,
        keep_alive: 30,
        username: Some("alice".into()),
        password: Some(Bytes::from_static(b"s3cret")),
        will: Some(Will {
            topic: "dev/7/status".into(),
            payload: Bytes::from_static(b"offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    }));

    let encoded = encode(&packet);
    // name(6) level(1) flags(1) keepalive(2) id(7) will(14 + 9) user(7) pass(8)
    assert_eq!(encoded[1] as usize, 55);
    // username | password | will retain | will qos 1 | will flag
    assert_eq!(encoded[9], 0x80 | 0x40 | 0x20 | 0x08 | 0x04);
    assert_eq!(decode(&encoded).unwrap(), packet);
}

#[test_case(0x01 ; "reserved bit")]
#[test_case(0x40 ; "password without username")]
#[test_case(0x08 ; "will qos without will flag")]
#[test_case(0x20 ; "will retain without will flag")]
#[test_case(0x1C ; "will qos 3")]
fn test_decode_connect_bad_flags(flags: u8) {
    #[rustfmt::skip]
    let frame = [
        0x10, 0x0C,
        0x00, 0x04, b'M', b'Q', b'T', b'T',
        0x04,
        flags,
        0x00, 0x3C,
        0x00, 0x00,
    ];
    assert!(decode(&frame).is_err());
}

// ============================================================================
// PUBLISH
// ============================================================================

#[test]
fn test_decode_publish_qos1() {
    #[rustfmt::skip]
    let frame = [
        0x33, 0x0B,
        0x00, 0x03, b'a', b'/', b'b',
        0x00, 0x07,
        b'2', b'1', b'.', b'5',
    ];

    let packet = decode(&frame).unwrap();
    assert_eq!(
        packet,
        Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: "a/b".into(),
            packet_id: Some(7),
            payload: Bytes::from_static(b"21.5"),
        })
    );
}

#[test]
fn test_encode_publish_dup_qos2() {
    let packet = Packet::Publish(Publish {
        dup: true,
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: "t".into(),
        packet_id: Some(0x0102),
        payload: Bytes::from_static(b"x"),
    });

    assert_eq!(
        &encode(&packet)[..],
        &[0x3C, 0x06, 0x00, 0x01, b't', 0x01, 0x02, b'x']
    );
}

#[test]
fn test_encode_publish_missing_packet_id() {
    let packet = Packet::Publish(Publish::new("t", "x", QoS::AtLeastOnce));
    let mut buf = BytesMut::new();
    assert!(Encoder::new().encode(&packet, &mut buf).is_err());
}

#[test_case(&[0x36, 0x05, 0x00, 0x01, b't', 0x00, 0x01] ; "qos 3")]
#[test_case(&[0x38, 0x04, 0x00, 0x01, b't', b'x'] ; "dup with qos 0")]
#[test_case(&[0x32, 0x05, 0x00, 0x01, b't', 0x00, 0x00] ; "zero packet id")]
#[test_case(&[0x30, 0x05, 0x00, 0x03, b'a', b'/', b'+'] ; "wildcard topic")]
fn test_decode_publish_invalid(frame: &[u8]) {
    assert!(decode(frame).is_err());
}

// ============================================================================
// Acknowledgements and subscriptions
// ============================================================================

#[test]
fn test_pubrel_requires_flags() {
    assert_eq!(
        decode(&[0x62, 0x02, 0x00, 0x09]).unwrap(),
        Packet::PubRel(PubRel::new(9))
    );
    assert_eq!(decode(&[0x60, 0x02, 0x00, 0x09]), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_decode_subscribe() {
    #[rustfmt::skip]
    let frame = [
        0x82, 0x0F,
        0x00, 0x01,
        0x00, 0x03, b'a', b'/', b'#', 0x01,
        0x00, 0x04, b'+', b'/', b'+', b'/', 0x02,
    ];

    match decode(&frame).unwrap() {
        Packet::Subscribe(s) => {
            assert_eq!(s.packet_id, 1);
            assert_eq!(
                s.filters,
                vec![
                    SubscribeFilter::new("a/#", QoS::AtLeastOnce),
                    SubscribeFilter::new("+/+/", QoS::ExactlyOnce),
                ]
            );
        }
        other => panic!("expected SUBSCRIBE, got {:?}", other),
    }
}

#[test]
fn test_decode_subscribe_reserved_bits() {
    let frame = [0x82, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x04];
    assert!(decode(&frame).is_err());
}

#[test]
fn test_decode_subscribe_empty() {
    assert!(decode(&[0x82, 0x02, 0x00, 0x01]).is_err());
}

#[test]
fn test_encode_suback() {
    let packet = Packet::SubAck(SubAck {
        packet_id: 10,
        return_codes: vec![
            SubAckReturnCode::Granted(QoS::AtLeastOnce),
            SubAckReturnCode::Failure,
        ],
    });
    assert_eq!(&encode(&packet)[..], &[0x90, 0x04, 0x00, 0x0A, 0x01, 0x80]);
}

#[test]
fn test_encode_connack() {
    let packet = Packet::ConnAck(ConnAck::refused(ConnectReturnCode::NotAuthorized));
    assert_eq!(&encode(&packet)[..], &[0x20, 0x02, 0x00, 0x05]);

    let packet = Packet::ConnAck(ConnAck::accepted(true));
    assert_eq!(&encode(&packet)[..], &[0x20, 0x02, 0x01, 0x00]);
}

// ============================================================================
// Framing
// ============================================================================

#[test]
fn test_partial_frames_wait_for_more() {
    let decoder = Decoder::new();
    assert_eq!(decoder.decode(&[0x30]).unwrap(), None);
    assert_eq!(decoder.decode(&[0x30, 0x05, 0x00, 0x01]).unwrap(), None);
}

#[test]
fn test_two_frames_in_one_buffer() {
    let decoder = Decoder::new();
    let buf = [0xC0, 0x00, 0xE0, 0x00];

    let (first, used) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingReq);
    let (second, _) = decoder.decode(&buf[used..]).unwrap().unwrap();
    assert_eq!(second, Packet::Disconnect);
}

#[test]
fn test_packet_too_large() {
    let decoder = Decoder::new().with_max_packet_size(4);
    assert_eq!(
        decoder.decode(&[0x30, 0x05, 0x00, 0x01, b't', b'x', b'y']),
        Err(DecodeError::PacketTooLarge)
    );
}

#[test]
fn test_reserved_packet_type() {
    assert_eq!(decode(&[0xF0, 0x00]), Err(DecodeError::InvalidPacketType(15)));
    assert_eq!(decode(&[0x00, 0x00]), Err(DecodeError::InvalidPacketType(0)));
}

#[test]
fn test_truncated_body_is_malformed() {
    // Remaining length says 2 but a PUBLISH topic needs more
    assert!(matches!(
        decode(&[0x30, 0x02, 0x00, 0x05]),
        Err(DecodeError::MalformedPacket(_))
    ));
}
