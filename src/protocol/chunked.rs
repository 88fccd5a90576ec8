//! Chunk Codec (C3): HTTP-style chunked transfer decode/encode with
//! the ICAP extensions `ieof` and `use-original-body=N` (spec §4.3).
//!
//! The decoder is incremental: [`ChunkedDecoder::decode`] consumes as
//! much of its input as it can, appends whatever decoded body bytes it
//! produced to the caller's `out` buffer, and reports how many input
//! bytes it used plus a [`StepResult`] so the caller knows whether to
//! read more, whether it just saw the end of the body (`Eof`), or
//! whether the framing was malformed (`Error`).

use crate::error::IcapError;
use crate::protocol::common::StepResult;

/// Chunk-size/extension lines longer than this are treated as
/// malformed rather than merely incomplete — guards against a
/// pathological peer growing the read buffer without bound.
const MAX_CHUNK_DEF_LINE: usize = 1024;

/// Upper bound on a single encoded chunk's payload size.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024 * 16;

/// Extra bytes reserved at the front of an encode buffer for the hex
/// length line, mirroring the fixed-offset trick the C ancestor uses
/// to avoid a copy; kept here only as a sizing hint for callers that
/// want to pre-reserve, since `Vec<u8>` makes the trick unnecessary for
/// correctness.
pub const EXTRA_CHUNK_SIZE: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadingChunkDef,
    ReadingChunkData { remaining: usize },
    ReadingChunkTrailer,
    ReadingFinalTrailer,
    Done,
}

/// Per-request incremental chunk decoder.
#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    state: State,
    /// Set once the terminating zero-length chunk has been fully
    /// consumed (including its trailer block).
    pub eof_received: bool,
    /// Set if the zero-length chunk carried the `ieof` extension.
    pub ieof: bool,
    /// Set if the zero-length chunk carried `use-original-body=N`.
    pub use_original_body: Option<u64>,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            state: State::ReadingChunkDef,
            eof_received: false,
            ieof: false,
            use_original_body: None,
        }
    }

    /// Feeds `input` to the decoder. Appends decoded body bytes to
    /// `out`. Returns the number of bytes of `input` consumed and a
    /// [`StepResult`]: `Ok` if it made progress and more framing
    /// remains, `NeedsMore` if `input` ended mid-frame, `Eof` once the
    /// terminating chunk (and its trailer) has been consumed, `Error`
    /// on malformed framing (propagated as [`IcapError::Protocol`]).
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(usize, StepResult), IcapError> {
        let mut pos = 0usize;
        loop {
            match self.state {
                State::Done => return Ok((pos, StepResult::Eof)),
                State::ReadingChunkDef => {
                    let rest = &input[pos..];
                    let Some(line_end) = find_crlf(rest) else {
                        if rest.len() > MAX_CHUNK_DEF_LINE {
                            return Err(IcapError::protocol("chunk size line exceeds maximum length", "chunk-codec"));
                        }
                        return Ok((pos, StepResult::NeedsMore));
                    };
                    let line = std::str::from_utf8(&rest[..line_end])
                        .map_err(|_| IcapError::protocol("chunk size line is not valid UTF-8", "chunk-codec"))?;
                    let (len_str, ext) = match line.split_once(';') {
                        Some((l, e)) => (l.trim(), Some(e)),
                        None => (line.trim(), None),
                    };
                    let len = usize::from_str_radix(len_str, 16)
                        .map_err(|_| IcapError::protocol(format!("invalid chunk length {len_str:?}"), "chunk-codec"))?;
                    pos += line_end + 2;
                    if len == 0 {
                        self.parse_zero_chunk_extension(ext);
                        self.state = State::ReadingFinalTrailer;
                    } else {
                        self.state = State::ReadingChunkData { remaining: len };
                    }
                }
                State::ReadingChunkData { remaining } => {
                    let available = input.len() - pos;
                    if available == 0 {
                        return Ok((pos, StepResult::NeedsMore));
                    }
                    let take = available.min(remaining);
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    let left = remaining - take;
                    if left == 0 {
                        self.state = State::ReadingChunkTrailer;
                    } else {
                        self.state = State::ReadingChunkData { remaining: left };
                        return Ok((pos, StepResult::NeedsMore));
                    }
                }
                State::ReadingChunkTrailer => {
                    let rest = &input[pos..];
                    if rest.len() < 2 {
                        return Ok((pos, StepResult::NeedsMore));
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(IcapError::protocol("missing CRLF after chunk data", "chunk-codec"));
                    }
                    pos += 2;
                    self.state = State::ReadingChunkDef;
                }
                State::ReadingFinalTrailer => {
                    // Trailer headers (if any) terminated by an empty
                    // line; the common case is the zero chunk's own
                    // CRLF immediately followed by an empty line.
                    let rest = &input[pos..];
                    let Some(line_end) = find_crlf(rest) else {
                        if rest.len() > MAX_CHUNK_DEF_LINE {
                            return Err(IcapError::protocol("trailer line exceeds maximum length", "chunk-codec"));
                        }
                        return Ok((pos, StepResult::NeedsMore));
                    };
                    pos += line_end + 2;
                    if line_end == 0 {
                        self.state = State::Done;
                        self.eof_received = true;
                        return Ok((pos, StepResult::Eof));
                    }
                    // non-empty trailer header line: consumed and ignored
                }
            }
        }
    }

    fn parse_zero_chunk_extension(&mut self, ext: Option<&str>) {
        let Some(ext) = ext else { return };
        for token in ext.split(';') {
            let token = token.trim();
            if token.eq_ignore_ascii_case("ieof") {
                self.ieof = true;
            } else if let Some(value) = token
                .strip_prefix("use-original-body=")
                .or_else(|| token.strip_prefix("use-original-body ="))
            {
                if let Ok(n) = value.trim().parse::<u64>() {
                    self.use_original_body = Some(n);
                }
            }
            // any other extension token is tolerated and ignored
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    memchr::memmem::find(buf, b"\r\n")
}

/// Encodes one data chunk: `HEX-LEN\r\nDATA\r\n`. `data` must be
/// `<= MAX_CHUNK_SIZE`.
pub fn encode_chunk(data: &[u8]) -> Result<Vec<u8>, IcapError> {
    if data.len() > MAX_CHUNK_SIZE {
        return Err(IcapError::protocol("chunk payload exceeds MAX_CHUNK_SIZE", "chunk-codec"));
    }
    let mut out = Vec::with_capacity(data.len() + EXTRA_CHUNK_SIZE);
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    Ok(out)
}

/// Encodes the plain terminating chunk: `0\r\n\r\n`, or
/// `0; ieof\r\n\r\n` when the sender has no more body to offer inside
/// preview.
pub fn encode_terminal(ieof: bool) -> Vec<u8> {
    if ieof {
        b"0; ieof\r\n\r\n".to_vec()
    } else {
        b"0\r\n\r\n".to_vec()
    }
}

/// Encodes the terminating chunk for a 206 response carrying
/// `use-original-body=N`, in the exact wire form the original
/// implementation emits.
pub fn encode_terminal_with_original_body(offset: u64) -> Vec<u8> {
    format!("0; use-original-body={offset}\r\n\r\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_single_chunk_then_terminal() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_chunk(b"hello").unwrap());
        wire.extend_from_slice(&encode_terminal(false));

        let mut dec = ChunkedDecoder::new();
        let mut out = Vec::new();
        let (consumed, result) = dec.decode(&wire, &mut out).unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(result, StepResult::Eof);
        assert_eq!(out, b"hello");
        assert!(dec.eof_received);
        assert!(!dec.ieof);
    }

    #[test]
    fn decode_recognizes_ieof_on_zero_chunk() {
        let wire = encode_terminal(true);
        let mut dec = ChunkedDecoder::new();
        let mut out = Vec::new();
        let (_, result) = dec.decode(&wire, &mut out).unwrap();
        assert_eq!(result, StepResult::Eof);
        assert!(dec.ieof);
        assert!(out.is_empty());
    }

    #[test]
    fn decode_recognizes_use_original_body() {
        let wire = encode_terminal_with_original_body(256);
        let mut dec = ChunkedDecoder::new();
        let mut out = Vec::new();
        dec.decode(&wire, &mut out).unwrap();
        assert_eq!(dec.use_original_body, Some(256));
    }

    #[test]
    fn unknown_extension_tokens_are_tolerated() {
        let wire = b"0; some-unknown-ext=1\r\n\r\n".to_vec();
        let mut dec = ChunkedDecoder::new();
        let mut out = Vec::new();
        let (_, result) = dec.decode(&wire, &mut out).unwrap();
        assert_eq!(result, StepResult::Eof);
        assert!(!dec.ieof);
        assert_eq!(dec.use_original_body, None);
    }

    #[test]
    fn partial_input_reports_needs_more() {
        let wire = encode_chunk(b"hello world").unwrap();
        let mut dec = ChunkedDecoder::new();
        let mut out = Vec::new();
        let (consumed, result) = dec.decode(&wire[..4], &mut out).unwrap();
        assert_eq!(result, StepResult::NeedsMore);
        assert_eq!(consumed, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn invalid_hex_length_is_an_error() {
        let wire = b"zz\r\n\r\n".to_vec();
        let mut dec = ChunkedDecoder::new();
        let mut out = Vec::new();
        let err = dec.decode(&wire, &mut out).unwrap_err();
        assert!(matches!(err, IcapError::Protocol { .. }));
    }

    #[test]
    fn round_trip_multi_chunk_body() {
        let body = b"the quick brown fox jumps over the lazy dog";
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_chunk(&body[..10]).unwrap());
        wire.extend_from_slice(&encode_chunk(&body[10..]).unwrap());
        wire.extend_from_slice(&encode_terminal(false));

        let mut dec = ChunkedDecoder::new();
        let mut out = Vec::new();
        let mut pos = 0;
        loop {
            let (consumed, result) = dec.decode(&wire[pos..], &mut out).unwrap();
            pos += consumed;
            if result == StepResult::Eof {
                break;
            }
        }
        assert_eq!(out, body);
    }
}
