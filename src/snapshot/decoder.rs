// External H.264 decoder subprocess. Annex-B units go in on stdin; raw
// planar frames come back on stdout in y4m framing, which carries the
// geometry so no SPS parsing is needed host-side.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tracing::debug;

use crate::error::{Error, Result};

/// One decoded 4:2:0 frame: Y plane then U then V.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

pub struct DecoderProcess {
    pub child: Child,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
}

/// Spawn the decoder tool reading Annex-B H.264 from stdin and writing
/// yuv420p frames in y4m framing to stdout.
pub fn spawn_decoder(decoder_path: &Path) -> Result<DecoderProcess> {
    let mut cmd = tokio::process::Command::new(decoder_path);
    cmd.args([
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "h264",
        "-i",
        "pipe:0",
        "-f",
        "yuv4mpegpipe",
        "-pix_fmt",
        "yuv420p",
        "pipe:1",
    ])
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::DecoderSpawn(format!("{}: {e}", decoder_path.display())))?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("[decoder] {line}");
            }
        });
    }

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    Ok(DecoderProcess {
        child,
        stdin,
        stdout,
    })
}

#[derive(Debug, PartialEq)]
enum ParseState {
    StreamHeader,
    FrameHeader,
    FrameData,
}

/// Incremental y4m stream parser. Bounded memory: holds at most one
/// frame plus a header line.
pub struct Y4mParser {
    state: ParseState,
    line: Vec<u8>,
    width: u32,
    height: u32,
    frame_len: usize,
    frame: Vec<u8>,
}

impl Y4mParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::StreamHeader,
            line: Vec::new(),
            width: 0,
            height: 0,
            frame_len: 0,
            frame: Vec::new(),
        }
    }

    /// Geometry from the stream header, once seen.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        if self.frame_len > 0 {
            Some((self.width, self.height))
        } else {
            None
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<RawFrame>> {
        let mut frames = Vec::new();
        let mut pos = 0;

        while pos < chunk.len() {
            match self.state {
                ParseState::StreamHeader | ParseState::FrameHeader => {
                    // Accumulate one newline-terminated header line.
                    match chunk[pos..].iter().position(|&b| b == b'\n') {
                        Some(nl) => {
                            self.line.extend_from_slice(&chunk[pos..pos + nl]);
                            pos += nl + 1;
                            let line = std::mem::take(&mut self.line);
                            self.consume_header_line(&line)?;
                        }
                        None => {
                            self.line.extend_from_slice(&chunk[pos..]);
                            if self.line.len() > 1024 {
                                return Err(Error::Parse(
                                    "decoder stream header exceeds 1KiB".into(),
                                ));
                            }
                            pos = chunk.len();
                        }
                    }
                }
                ParseState::FrameData => {
                    let needed = self.frame_len - self.frame.len();
                    let take = needed.min(chunk.len() - pos);
                    self.frame.extend_from_slice(&chunk[pos..pos + take]);
                    pos += take;
                    if self.frame.len() == self.frame_len {
                        frames.push(RawFrame {
                            width: self.width,
                            height: self.height,
                            data: std::mem::take(&mut self.frame),
                        });
                        self.state = ParseState::FrameHeader;
                    }
                }
            }
        }

        Ok(frames)
    }

    fn consume_header_line(&mut self, line: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(line)
            .map_err(|_| Error::Parse("non-utf8 decoder header".into()))?;

        match self.state {
            ParseState::StreamHeader => {
                let mut tokens = text.split_ascii_whitespace();
                if tokens.next() != Some("YUV4MPEG2") {
                    return Err(Error::Parse(format!(
                        "unexpected decoder stream header: {text:?}"
                    )));
                }
                for token in tokens {
                    if let Some(v) = token.strip_prefix('W') {
                        self.width = v
                            .parse()
                            .map_err(|_| Error::Parse(format!("bad width: {token}")))?;
                    } else if let Some(v) = token.strip_prefix('H') {
                        self.height = v
                            .parse()
                            .map_err(|_| Error::Parse(format!("bad height: {token}")))?;
                    } else if let Some(v) = token.strip_prefix('C') {
                        if !v.starts_with("420") {
                            return Err(Error::Parse(format!(
                                "unsupported decoder colorspace: {token}"
                            )));
                        }
                    }
                }
                if self.width == 0 || self.height == 0 {
                    return Err(Error::Parse(format!("missing geometry in header: {text:?}")));
                }
                if self.width % 2 != 0 || self.height % 2 != 0 {
                    return Err(Error::Parse(format!(
                        "odd 4:2:0 geometry {}x{}",
                        self.width, self.height
                    )));
                }
                self.frame_len = (self.width * self.height * 3 / 2) as usize;
                self.state = ParseState::FrameHeader;
            }
            ParseState::FrameHeader => {
                if !text.starts_with("FRAME") {
                    return Err(Error::Parse(format!("expected FRAME marker, got {text:?}")));
                }
                self.frame.reserve(self.frame_len);
                self.state = ParseState::FrameData;
            }
            ParseState::FrameData => unreachable!("header line while reading frame data"),
        }
        Ok(())
    }
}

impl Default for Y4mParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stream(frames: usize) -> Vec<u8> {
        let mut data = b"YUV4MPEG2 W4 H2 F30:1 Ip A1:1 C420mpeg2\n".to_vec();
        for i in 0..frames {
            data.extend_from_slice(b"FRAME\n");
            data.extend(std::iter::repeat(i as u8).take(4 * 2 * 3 / 2));
        }
        data
    }

    #[test]
    fn parses_header_and_frames() {
        let mut parser = Y4mParser::new();
        let frames = parser.push(&sample_stream(2)).unwrap();
        assert_eq!(parser.dimensions(), Some((4, 2)));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].width, 4);
        assert_eq!(frames[0].height, 2);
        assert_eq!(frames[0].data.len(), 12);
        assert!(frames[0].data.iter().all(|&b| b == 0));
        assert!(frames[1].data.iter().all(|&b| b == 1));
    }

    #[test]
    fn handles_arbitrary_chunk_splits() {
        let stream = sample_stream(3);
        for split in 1..stream.len() - 1 {
            let mut parser = Y4mParser::new();
            let mut frames = parser.push(&stream[..split]).unwrap();
            frames.extend(parser.push(&stream[split..]).unwrap());
            assert_eq!(frames.len(), 3, "split at {split}");
        }
    }

    #[test]
    fn frame_header_params_are_tolerated() {
        let mut data = b"YUV4MPEG2 W2 H2 C420jpeg\n".to_vec();
        data.extend_from_slice(b"FRAME Ixyz\n");
        data.extend(std::iter::repeat(7u8).take(6));
        let mut parser = Y4mParser::new();
        let frames = parser.push(&data).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn rejects_unknown_magic() {
        let mut parser = Y4mParser::new();
        assert!(parser.push(b"RIFFdata\n").is_err());
    }

    #[test]
    fn rejects_non_420_colorspace() {
        let mut parser = Y4mParser::new();
        assert!(parser.push(b"YUV4MPEG2 W4 H2 C444\n").is_err());
    }

    #[test]
    fn rejects_missing_geometry() {
        let mut parser = Y4mParser::new();
        assert!(parser.push(b"YUV4MPEG2 F30:1\n").is_err());
    }
}
