use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("op {op} carried no payload")]
    Missing { op: u8 },
    #[error("malformed payload for op {op} (event {event:?}): {source}")]
    Malformed {
        op: u8,
        event: Option<String>,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("unexpected packet type {0:#06x}")]
    PacketType(u16),
    #[error("unexpected declared length {0}")]
    DeclaredLength(u16),
    #[error("invalid address field: {0}")]
    Address(String),
}
