//! Page-level Ogg demuxing. Each page's packet data becomes one frame; the
//! transcoder is asked for 20 ms pages so a page carries one Opus packet.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
/// Header type flag: the page continues a packet begun on the previous page.
pub const CONTINUED_PACKET: u8 = 0x01;
const HEADER_LEN: usize = 27;

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("bad capture pattern {0:?}")]
    CapturePattern([u8; 4]),
    #[error("unsupported ogg version {0}")]
    Version(u8),
    #[error("page {sequence} failed crc check (expected {expected:#010x}, got {actual:#010x})")]
    Checksum {
        sequence: u32,
        expected: u32,
        actual: u32,
    },
    #[error("stream ended inside a page")]
    Truncated,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OggPage {
    pub header_type: u8,
    pub granule_position: u64,
    pub serial: u32,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl OggPage {
    /// Opus identification and comment headers carry no audio.
    pub fn is_stream_header(&self) -> bool {
        self.payload.starts_with(b"OpusHead") || self.payload.starts_with(b"OpusTags")
    }

    pub fn is_continuation(&self) -> bool {
        self.header_type & CONTINUED_PACKET != 0
    }

    /// Serializes the page with a valid checksum. Test fixtures use this to
    /// build transcoder output.
    pub fn encode(&self) -> Vec<u8> {
        let mut segments = Vec::new();
        let mut remaining = self.payload.len();
        loop {
            let lace = remaining.min(255);
            segments.push(lace as u8);
            remaining -= lace;
            if lace < 255 {
                break;
            }
        }

        let mut out = Vec::with_capacity(HEADER_LEN + segments.len() + self.payload.len());
        out.extend_from_slice(CAPTURE_PATTERN);
        out.push(0);
        out.push(self.header_type);
        out.extend_from_slice(&self.granule_position.to_le_bytes());
        out.extend_from_slice(&self.serial.to_le_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.push(segments.len() as u8);
        out.extend_from_slice(&segments);
        out.extend_from_slice(&self.payload);

        let crc = checksum(&out);
        out[22..26].copy_from_slice(&crc.to_le_bytes());
        out
    }
}

pub struct OggReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> OggReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next page. `Ok(None)` means the stream ended on a page
    /// boundary.
    pub async fn next_page(&mut self) -> Result<Option<OggPage>, DemuxError> {
        let mut header = [0u8; HEADER_LEN];
        if !self.fill_or_eof(&mut header).await? {
            return Ok(None);
        }

        let pattern = [header[0], header[1], header[2], header[3]];
        if &pattern != CAPTURE_PATTERN {
            return Err(DemuxError::CapturePattern(pattern));
        }
        if header[4] != 0 {
            return Err(DemuxError::Version(header[4]));
        }

        let header_type = header[5];
        let granule_position = u64::from_le_bytes(read_array(&header[6..14]));
        let serial = u32::from_le_bytes(read_array(&header[14..18]));
        let sequence = u32::from_le_bytes(read_array(&header[18..22]));
        let expected = u32::from_le_bytes(read_array(&header[22..26]));
        let segment_count = header[26] as usize;

        let mut segments = vec![0u8; segment_count];
        self.read_exact(&mut segments).await?;
        let body_len: usize = segments.iter().map(|lace| *lace as usize).sum();
        let mut payload = vec![0u8; body_len];
        self.read_exact(&mut payload).await?;

        let mut crc = Crc::new();
        header[22..26].fill(0);
        crc.update(&header);
        crc.update(&segments);
        crc.update(&payload);
        let actual = crc.finish();
        if actual != expected {
            return Err(DemuxError::Checksum {
                sequence,
                expected,
                actual,
            });
        }

        Ok(Some(OggPage {
            header_type,
            granule_position,
            serial,
            sequence,
            payload,
        }))
    }

    async fn fill_or_eof(&mut self, buf: &mut [u8]) -> Result<bool, DemuxError> {
        let mut filled = 0;
        while filled < buf.len() {
            let read = self.inner.read(&mut buf[filled..]).await?;
            if read == 0 {
                return if filled == 0 {
                    Ok(false)
                } else {
                    Err(DemuxError::Truncated)
                };
            }
            filled += read;
        }
        Ok(true)
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DemuxError> {
        match self.inner.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(DemuxError::Truncated)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

const CRC_TABLE: [u32; 256] = crc_table();

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut r = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            r = if r & 0x8000_0000 != 0 {
                (r << 1) ^ 0x04c1_1db7
            } else {
                r << 1
            };
            bit += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
}

struct Crc(u32);

impl Crc {
    fn new() -> Self {
        Self(0)
    }

    fn update(&mut self, bytes: &[u8]) {
        for byte in bytes {
            let index = ((self.0 >> 24) as u8 ^ byte) as usize;
            self.0 = (self.0 << 8) ^ CRC_TABLE[index];
        }
    }

    fn finish(&self) -> u32 {
        self.0
    }
}

fn checksum(bytes: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(bytes);
    crc.finish()
}

#[cfg(test)]
#[path = "tests/ogg_tests.rs"]
mod tests;
