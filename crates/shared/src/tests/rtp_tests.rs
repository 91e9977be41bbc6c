use super::*;

#[test]
fn discovery_request_layout() {
    let packet = encode_ip_discovery_request(0x0102_0304, 50_000);

    assert_eq!(packet.len(), 74);
    assert_eq!(&packet[0..2], &[0x00, 0x01]);
    assert_eq!(&packet[2..4], &[0x00, 70]);
    assert_eq!(&packet[4..8], &[0x01, 0x02, 0x03, 0x04]);
    assert!(packet[8..72].iter().all(|b| *b == 0));
    assert_eq!(&packet[72..74], &50_000u16.to_be_bytes());
}

#[test]
fn discovery_response_parses_address_and_port() {
    let packet = encode_ip_discovery_response(7, "203.0.113.9", 41_234).expect("encode");
    let discovered = decode_ip_discovery_response(&packet).expect("decode");

    assert_eq!(discovered.ssrc, 7);
    assert_eq!(discovered.ip.to_string(), "203.0.113.9");
    assert_eq!(discovered.port, 41_234);
}

#[test]
fn discovery_response_handles_boundary_values() {
    for port in [0u16, 65_535] {
        let packet = encode_ip_discovery_response(1, "255.255.255.255", port).expect("encode");
        let discovered = decode_ip_discovery_response(&packet).expect("decode");
        assert_eq!(discovered.ip.to_string(), "255.255.255.255");
        assert_eq!(discovered.port, port);
    }
}

#[test]
fn discovery_response_rejects_malformed_packets() {
    let good = encode_ip_discovery_response(1, "10.0.0.1", 9).expect("encode");

    assert_eq!(
        decode_ip_discovery_response(&good[..73]),
        Err(WireError::Length {
            expected: 74,
            actual: 73
        })
    );

    let mut wrong_type = good;
    wrong_type[1] = 0x01;
    assert_eq!(
        decode_ip_discovery_response(&wrong_type),
        Err(WireError::PacketType(1))
    );

    let mut wrong_length = good;
    wrong_length[3] = 71;
    assert_eq!(
        decode_ip_discovery_response(&wrong_length),
        Err(WireError::DeclaredLength(71))
    );

    let mut unterminated = good;
    unterminated[8..72].fill(b'1');
    assert!(matches!(
        decode_ip_discovery_response(&unterminated),
        Err(WireError::Address(_))
    ));

    let garbage = encode_ip_discovery_response(1, "not-an-ip", 9).expect("encode");
    assert!(matches!(
        decode_ip_discovery_response(&garbage),
        Err(WireError::Address(_))
    ));
}

#[test]
fn rtp_header_is_big_endian_with_fixed_prefix() {
    let header = RtpHeader {
        sequence: 0xABCD,
        timestamp: 0x0102_0304,
        ssrc: 0xDEAD_BEEF,
    };
    let bytes = header.encode();

    assert_eq!(
        bytes,
        [0x80, 0x78, 0xAB, 0xCD, 0x01, 0x02, 0x03, 0x04, 0xDE, 0xAD, 0xBE, 0xEF]
    );
    assert_eq!(RtpHeader::decode(&bytes).expect("decode"), header);
}

#[test]
fn nonce_is_header_followed_by_zeroes() {
    let header = RtpHeader {
        sequence: 1,
        timestamp: 960,
        ssrc: 42,
    };
    let nonce = header.nonce();

    assert_eq!(&nonce[..12], &header.encode());
    assert!(nonce[12..].iter().all(|b| *b == 0));
}
