use super::*;

fn page(sequence: u32, payload: &[u8]) -> OggPage {
    OggPage {
        header_type: 0,
        granule_position: u64::from(sequence) * 960,
        serial: 0x1234,
        sequence,
        payload: payload.to_vec(),
    }
}

#[test]
fn crc_matches_reference_value() {
    // Reference CRC-32/OGG ("check" value for the catalogue input).
    assert_eq!(checksum(b"123456789"), 0x89a1_897f);
}

#[tokio::test]
async fn reads_consecutive_pages_until_eof() {
    let mut bytes = page(0, b"OpusHead-ish").encode();
    bytes.extend(page(1, &[7u8; 300]).encode());
    bytes.extend(page(2, b"").encode());

    let mut reader = OggReader::new(&bytes[..]);
    let first = reader.next_page().await.expect("page").expect("some");
    assert!(first.is_stream_header());
    assert_eq!(first.serial, 0x1234);

    let second = reader.next_page().await.expect("page").expect("some");
    assert_eq!(second.payload, vec![7u8; 300]);
    assert_eq!(second.granule_position, 960);
    assert!(!second.is_stream_header());

    let third = reader.next_page().await.expect("page").expect("some");
    assert!(third.payload.is_empty());

    assert!(reader.next_page().await.expect("eof").is_none());
}

#[tokio::test]
async fn payload_of_exactly_255_bytes_round_trips() {
    let bytes = page(3, &[1u8; 255]).encode();
    let mut reader = OggReader::new(&bytes[..]);
    let parsed = reader.next_page().await.expect("page").expect("some");
    assert_eq!(parsed.payload.len(), 255);
}

#[tokio::test]
async fn rejects_corrupted_pages() {
    let mut bytes = page(1, b"audio").encode();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    let mut reader = OggReader::new(&bytes[..]);
    assert!(matches!(
        reader.next_page().await,
        Err(DemuxError::Checksum { sequence: 1, .. })
    ));

    let mut reader = OggReader::new(&b"RIFF0000000000000000000000000000"[..]);
    assert!(matches!(
        reader.next_page().await,
        Err(DemuxError::CapturePattern(_))
    ));
}

#[tokio::test]
async fn truncated_page_is_an_error_not_eof() {
    let bytes = page(1, b"audio payload").encode();
    let mut reader = OggReader::new(&bytes[..bytes.len() - 4]);
    assert!(matches!(reader.next_page().await, Err(DemuxError::Truncated)));

    let mut reader = OggReader::new(&bytes[..10]);
    assert!(matches!(reader.next_page().await, Err(DemuxError::Truncated)));
}
