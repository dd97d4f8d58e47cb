// H.264 unit extraction from an arbitrary byte stream.
// Pure streaming parser: no I/O, no timing assumptions beyond stamping
// each completed unit. Input chunks may split units at any byte.

use std::time::Instant;

use bytes::Bytes;

/// Largest NAL payload we accept while probing for AVCC framing.
const MAX_NAL_BYTES: usize = 4 * 1024 * 1024;
/// Garbage-flood guard while the framing is still undetermined.
const MAX_PROBE_BYTES: usize = 16 * 1024 * 1024;

const ANNEXB_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// NAL unit classification. The type is the low 5 bits of the first
/// payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Sps,
    Pps,
    Aud,
    Sei,
    Idr,
    NonIdr,
    Other,
}

impl UnitKind {
    pub fn from_nal_type(nal_type: u8) -> Self {
        match nal_type {
            1..=4 => UnitKind::NonIdr,
            5 => UnitKind::Idr,
            6 => UnitKind::Sei,
            7 => UnitKind::Sps,
            8 => UnitKind::Pps,
            9 => UnitKind::Aud,
            _ => UnitKind::Other,
        }
    }

    /// Video coding layer units carry picture data.
    pub fn is_vcl(&self) -> bool {
        matches!(self, UnitKind::Idr | UnitKind::NonIdr)
    }
}

/// One self-contained Annex-B unit: start code plus NAL payload.
#[derive(Debug, Clone)]
pub struct H264Unit {
    pub kind: UnitKind,
    pub bytes: Bytes,
    pub generated_at: Instant,
}

impl H264Unit {
    /// Build a unit from Annex-B bytes (start code included).
    fn from_annexb(bytes: Bytes) -> Option<Self> {
        let payload_start = start_code_prefix_len(&bytes)?;
        let payload = bytes.get(payload_start)?;
        Some(Self {
            kind: UnitKind::from_nal_type(payload & 0x1F),
            bytes,
            generated_at: Instant::now(),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn start_code_prefix_len(data: &[u8]) -> Option<usize> {
    if data.len() >= 4 && data[..4] == ANNEXB_START_CODE {
        Some(4)
    } else if data.len() >= 3 && data[..3] == [0x00, 0x00, 0x01] {
        Some(3)
    } else {
        None
    }
}

/// Find the next Annex-B start code in `data`, returning its offset.
fn find_start_code(data: &[u8]) -> Option<usize> {
    for i in 0..data.len().saturating_sub(2) {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some(i);
            }
            if data.len() > i + 3 && data[i + 2] == 0 && data[i + 3] == 1 {
                return Some(i);
            }
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Not yet determined; probing.
    Unknown,
    AnnexB,
    /// Length-prefixed input, rewritten to Annex-B on emission.
    Avcc,
}

/// Streaming NAL extractor. Feed arbitrary chunks; completed units come
/// out in order, always Annex-B framed.
pub struct UnitExtractor {
    buf: Vec<u8>,
    framing: Framing,
}

impl UnitExtractor {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(64 * 1024),
            framing: Framing::Unknown,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<H264Unit> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        if self.framing == Framing::Unknown {
            self.detect_framing();
        }

        match self.framing {
            Framing::Unknown => {
                if self.buf.len() > MAX_PROBE_BYTES {
                    // Garbage flood with no recognizable framing: keep a
                    // tail that could still hold a partial start code.
                    let keep_from = self.buf.len() - 3;
                    self.buf.drain(..keep_from);
                }
            }
            Framing::AnnexB => self.drain_annexb(&mut out),
            Framing::Avcc => self.drain_avcc(&mut out),
        }

        out
    }

    /// Decide the input framing. A stream that opens on a start code is
    /// Annex-B outright (a 3-byte start code would otherwise read as a
    /// plausible length prefix). AVCC is assumed only when no start code
    /// has been seen and at least two consecutive complete units match
    /// exact length-prefixed boundaries. A start code behind leading
    /// garbage locks Annex-B too, with the garbage dropped silently.
    fn detect_framing(&mut self) {
        if start_code_prefix_len(&self.buf).is_some() {
            self.framing = Framing::AnnexB;
            return;
        }
        if looks_like_avcc(&self.buf) {
            self.framing = Framing::Avcc;
            return;
        }
        if let Some(idx) = find_start_code(&self.buf) {
            self.buf.drain(..idx);
            self.framing = Framing::AnnexB;
        }
    }

    fn drain_annexb(&mut self, out: &mut Vec<H264Unit>) {
        loop {
            let Some(prefix_len) = start_code_prefix_len(&self.buf) else {
                // Lost sync (should not happen after lock-on); resync.
                match find_start_code(&self.buf) {
                    Some(idx) => {
                        self.buf.drain(..idx);
                        continue;
                    }
                    None => return,
                }
            };
            // The unit ends where the next start code begins.
            let Some(offset) = find_start_code(&self.buf[prefix_len..]) else {
                return;
            };
            let end = prefix_len + offset;
            let unit_bytes = Bytes::copy_from_slice(&self.buf[..end]);
            self.buf.drain(..end);
            if let Some(unit) = H264Unit::from_annexb(unit_bytes) {
                out.push(unit);
            }
        }
    }

    fn drain_avcc(&mut self, out: &mut Vec<H264Unit>) {
        loop {
            if self.buf.len() < 4 {
                return;
            }
            let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            if len == 0 || len > MAX_NAL_BYTES {
                // Corrupt length prefix; drop everything buffered and
                // wait for the stream to recover at a sane prefix.
                self.buf.clear();
                return;
            }
            if self.buf.len() < 4 + len {
                return;
            }
            let mut annexb = Vec::with_capacity(4 + len);
            annexb.extend_from_slice(&ANNEXB_START_CODE);
            annexb.extend_from_slice(&self.buf[4..4 + len]);
            self.buf.drain(..4 + len);
            if let Some(unit) = H264Unit::from_annexb(Bytes::from(annexb)) {
                out.push(unit);
            }
        }
    }
}

impl Default for UnitExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// AVCC probe: two consecutive complete units whose 4-byte big-endian
/// length prefixes land exactly on plausible NAL boundaries
/// (forbidden_zero_bit clear, sane size).
fn looks_like_avcc(buf: &[u8]) -> bool {
    let mut pos = 0usize;
    for _ in 0..2 {
        if buf.len() < pos + 4 {
            return false;
        }
        let len =
            u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
        if len == 0 || len > MAX_NAL_BYTES {
            return false;
        }
        if buf.len() < pos + 4 + len {
            return false;
        }
        // forbidden_zero_bit must be 0 in a valid NAL header
        if buf[pos + 4] & 0x80 != 0 {
            return false;
        }
        pos += 4 + len;
    }
    true
}
