//! Binary formats spoken on the voice UDP socket: the IP discovery exchange and
//! the fixed RTP header that prefixes every sealed audio packet.

use std::net::IpAddr;

use crate::error::WireError;

pub const IP_DISCOVERY_LEN: usize = 74;
pub const IP_DISCOVERY_REQUEST: u16 = 0x0001;
pub const IP_DISCOVERY_RESPONSE: u16 = 0x0002;
const IP_DISCOVERY_BODY_LEN: u16 = 70;
const ADDRESS_FIELD: std::ops::Range<usize> = 8..72;

pub const RTP_HEADER_LEN: usize = 12;
pub const RTP_VERSION_FLAGS: u8 = 0x80;
pub const RTP_PAYLOAD_TYPE: u8 = 0x78;
pub const NONCE_LEN: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAddress {
    pub ssrc: u32,
    pub ip: IpAddr,
    pub port: u16,
}

pub fn encode_ip_discovery_request(ssrc: u32, port: u16) -> [u8; IP_DISCOVERY_LEN] {
    let mut packet = [0u8; IP_DISCOVERY_LEN];
    packet[0..2].copy_from_slice(&IP_DISCOVERY_REQUEST.to_be_bytes());
    packet[2..4].copy_from_slice(&IP_DISCOVERY_BODY_LEN.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    packet[72..74].copy_from_slice(&port.to_be_bytes());
    packet
}

/// Builds the response a voice server would send back. Used by test fixtures.
pub fn encode_ip_discovery_response(
    ssrc: u32,
    ip: &str,
    port: u16,
) -> Result<[u8; IP_DISCOVERY_LEN], WireError> {
    let field_len = ADDRESS_FIELD.end - ADDRESS_FIELD.start;
    if ip.len() >= field_len {
        return Err(WireError::Address(format!("{ip} does not fit")));
    }
    let mut packet = [0u8; IP_DISCOVERY_LEN];
    packet[0..2].copy_from_slice(&IP_DISCOVERY_RESPONSE.to_be_bytes());
    packet[2..4].copy_from_slice(&IP_DISCOVERY_BODY_LEN.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    packet[ADDRESS_FIELD.start..ADDRESS_FIELD.start + ip.len()].copy_from_slice(ip.as_bytes());
    packet[72..74].copy_from_slice(&port.to_be_bytes());
    Ok(packet)
}

pub fn decode_ip_discovery_response(packet: &[u8]) -> Result<DiscoveredAddress, WireError> {
    if packet.len() != IP_DISCOVERY_LEN {
        return Err(WireError::Length {
            expected: IP_DISCOVERY_LEN,
            actual: packet.len(),
        });
    }
    let kind = u16::from_be_bytes([packet[0], packet[1]]);
    if kind != IP_DISCOVERY_RESPONSE {
        return Err(WireError::PacketType(kind));
    }
    let declared = u16::from_be_bytes([packet[2], packet[3]]);
    if declared != IP_DISCOVERY_BODY_LEN {
        return Err(WireError::DeclaredLength(declared));
    }
    let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);

    let field = &packet[ADDRESS_FIELD];
    let end = field
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| WireError::Address("address is not NUL-terminated".into()))?;
    let text = std::str::from_utf8(&field[..end])
        .map_err(|_| WireError::Address("address is not UTF-8".into()))?;
    let ip = text
        .parse::<IpAddr>()
        .map_err(|_| WireError::Address(format!("{text:?} is not an IP address")))?;
    let port = u16::from_be_bytes([packet[72], packet[73]]);

    Ok(DiscoveredAddress { ssrc, ip, port })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn encode(&self) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = RTP_VERSION_FLAGS;
        header[1] = RTP_PAYLOAD_TYPE;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < RTP_HEADER_LEN {
            return Err(WireError::Length {
                expected: RTP_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[0] != RTP_VERSION_FLAGS || bytes[1] != RTP_PAYLOAD_TYPE {
            return Err(WireError::PacketType(u16::from_be_bytes([bytes[0], bytes[1]])));
        }
        Ok(Self {
            sequence: u16::from_be_bytes([bytes[2], bytes[3]]),
            timestamp: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            ssrc: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }

    /// Header bytes zero-padded to the 24-byte secretbox nonce.
    pub fn nonce(&self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..RTP_HEADER_LEN].copy_from_slice(&self.encode());
        nonce
    }
}

#[cfg(test)]
#[path = "tests/rtp_tests.rs"]
mod tests;
