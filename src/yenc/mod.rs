//! Streaming yEnc decoder.
//!
//! Bodies arrive as CRLF-terminated text lines off an NNTP connection.
//! Header lines (`=ybegin`, `=ypart`, `=yend`) are parsed as text; data
//! lines run through a byte-level state machine with carry state, so a
//! body can be decoded incrementally without buffering the whole article.
//! A running CRC32 over the decoded bytes is checked against the declared
//! `pcrc32` at `=yend`.

pub mod crc;
pub mod encoder;
pub mod scalar;
pub mod simd;

pub use crc::{Crc32, crc32_combine};
pub use scalar::DecodeState;

use crate::error::DecodeError;

/// Parsed `=ybegin` header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BeginHeader {
    /// Part number for multi-part posts
    pub part: Option<u32>,
    /// Declared line length (informational)
    pub line: Option<u32>,
    /// Size of the complete file
    pub size: u64,
    /// Filename declared by the poster
    pub name: String,
}

/// Parsed `=ypart` header (1-based inclusive byte range in the final file)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartHeader {
    /// First byte position, 1-based
    pub begin: u64,
    /// Last byte position, 1-based
    pub end: u64,
}

/// Parsed `=yend` trailer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndTrailer {
    /// Decoded size of this part
    pub size: u64,
    /// Part number echo
    pub part: Option<u32>,
    /// CRC of this part's decoded bytes
    pub pcrc32: Option<u32>,
    /// CRC of the whole file (single-part posts)
    pub crc32: Option<u32>,
}

/// Metadata of a successfully decoded article
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedArticle {
    /// Filename declared in `=ybegin`
    pub filename: String,
    /// Size of the complete file
    pub file_size: u64,
    /// Part number, if the post declared one
    pub part: Option<u32>,
    /// 0-based byte offset of this part within the file
    pub offset: u64,
    /// Number of decoded bytes
    pub size: u64,
    /// CRC32 of the decoded bytes (verified against the trailer)
    pub crc: u32,
}

/// Outcome of feeding one line to the decoder
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineOutcome {
    /// Keep feeding lines
    Continue,
    /// `=yend` was consumed; call [`ArticleDecoder::finish`]
    End,
}

/// Streaming decoder for one article body.
#[derive(Default)]
pub struct ArticleDecoder {
    state: DecodeState,
    begin: Option<BeginHeader>,
    part: Option<PartHeader>,
    end: Option<EndTrailer>,
    crc: crc32fast::Hasher,
    decoded: u64,
}

impl ArticleDecoder {
    /// Create a decoder ready for the first body line
    pub fn new() -> Self {
        Self::default()
    }

    /// The `=ybegin` header, once seen
    pub fn begin(&self) -> Option<&BeginHeader> {
        self.begin.as_ref()
    }

    /// The `=ypart` header, once seen
    pub fn part(&self) -> Option<&PartHeader> {
        self.part.as_ref()
    }

    /// Expected decoded size of this part, once the headers are in.
    ///
    /// Used to size the cache segment before data lines arrive.
    pub fn expected_size(&self) -> Option<u64> {
        match (&self.part, &self.begin) {
            (Some(part), _) => Some(part.end.saturating_sub(part.begin) + 1),
            (None, Some(begin)) => Some(begin.size),
            (None, None) => None,
        }
    }

    /// Feed one body line (without its CRLF terminator), appending decoded
    /// bytes to `out`.
    pub fn feed_line(
        &mut self,
        line: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<LineOutcome, DecodeError> {
        if self.begin.is_none() {
            if let Some(rest) = line.strip_prefix(b"=ybegin ") {
                self.begin = Some(parse_begin(rest)?);
            }
            // junk before =ybegin (headers, comments) is skipped
            return Ok(LineOutcome::Continue);
        }

        if self.part.is_none() && self.decoded == 0 {
            if let Some(rest) = line.strip_prefix(b"=ypart ") {
                self.part = Some(parse_part(rest)?);
                return Ok(LineOutcome::Continue);
            }
        }

        if let Some(rest) = line.strip_prefix(b"=yend ") {
            self.end = Some(parse_end(rest)?);
            return Ok(LineOutcome::End);
        }

        let before = out.len();
        simd::decode_chunk(line, out, &mut self.state);
        // reinstate the CRLF the line reader stripped, so dot-unstuffing
        // arms for the next line
        self.state = scalar::step(self.state, b'\r', out);
        self.state = scalar::step(self.state, b'\n', out);

        let produced = &out[before..];
        self.crc.update(produced);
        self.decoded += produced.len() as u64;

        Ok(LineOutcome::Continue)
    }

    /// Validate sizes and CRC and return the article metadata.
    pub fn finish(self) -> Result<DecodedArticle, DecodeError> {
        let begin = self.begin.ok_or(DecodeError::MissingYBegin)?;
        let end = self.end.ok_or(DecodeError::MissingYEnd)?;

        if end.size != self.decoded {
            return Err(DecodeError::SizeMismatch {
                declared: end.size,
                decoded: self.decoded,
            });
        }

        if let Some(part) = &self.part {
            let declared = part.end.saturating_sub(part.begin) + 1;
            if declared != self.decoded {
                return Err(DecodeError::SizeMismatch {
                    declared,
                    decoded: self.decoded,
                });
            }
        } else if begin.size != self.decoded {
            return Err(DecodeError::SizeMismatch {
                declared: begin.size,
                decoded: self.decoded,
            });
        }

        let computed = self.crc.finalize();
        if let Some(declared) = end.pcrc32.or(end.crc32) {
            if declared != computed {
                return Err(DecodeError::CrcMismatch { declared, computed });
            }
        }

        Ok(DecodedArticle {
            offset: self.part.map(|p| p.begin - 1).unwrap_or(0),
            filename: begin.name,
            file_size: begin.size,
            part: begin.part,
            size: self.decoded,
            crc: computed,
        })
    }
}

fn header_text(rest: &[u8]) -> Result<&str, DecodeError> {
    std::str::from_utf8(rest)
        .map_err(|_| DecodeError::MalformedLine(String::from_utf8_lossy(rest).into_owned()))
}

fn parse_begin(rest: &[u8]) -> Result<BeginHeader, DecodeError> {
    let text = header_text(rest)?;
    let mut part = None;
    let mut line = None;
    let mut size = None;
    let mut name = None;

    for (key, value) in attrs(text) {
        match key {
            "part" => part = Some(parse_num(value, text)? as u32),
            "line" => line = Some(parse_num(value, text)? as u32),
            "size" => size = Some(parse_num(value, text)?),
            // name= consumes the rest of the line, spaces included
            "name" => name = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(BeginHeader {
        part,
        line,
        size: size.ok_or_else(|| DecodeError::MalformedLine(text.to_string()))?,
        name: name.ok_or_else(|| DecodeError::MalformedLine(text.to_string()))?,
    })
}

fn parse_part(rest: &[u8]) -> Result<PartHeader, DecodeError> {
    let text = header_text(rest)?;
    let mut begin = None;
    let mut end = None;

    for (key, value) in attrs(text) {
        match key {
            "begin" => begin = Some(parse_num(value, text)?),
            "end" => end = Some(parse_num(value, text)?),
            _ => {}
        }
    }

    let begin = begin.ok_or_else(|| DecodeError::MalformedLine(text.to_string()))?;
    let end = end.ok_or_else(|| DecodeError::MalformedLine(text.to_string()))?;
    if begin == 0 || end < begin {
        return Err(DecodeError::MalformedLine(text.to_string()));
    }

    Ok(PartHeader { begin, end })
}

fn parse_end(rest: &[u8]) -> Result<EndTrailer, DecodeError> {
    let text = header_text(rest)?;
    let mut size = None;
    let mut part = None;
    let mut pcrc32 = None;
    let mut crc32 = None;

    for (key, value) in attrs(text) {
        match key {
            "size" => size = Some(parse_num(value, text)?),
            "part" => part = Some(parse_num(value, text)? as u32),
            "pcrc32" => pcrc32 = Some(parse_hex(value, text)?),
            "crc32" => crc32 = Some(parse_hex(value, text)?),
            _ => {}
        }
    }

    Ok(EndTrailer {
        size: size.ok_or_else(|| DecodeError::MalformedLine(text.to_string()))?,
        part,
        pcrc32,
        crc32,
    })
}

/// Iterate `key=value` attributes; `name=` swallows the rest of the line.
fn attrs(text: &str) -> impl Iterator<Item = (&str, &str)> {
    let mut remaining = text.trim_end_matches(['\r', '\n']);
    std::iter::from_fn(move || {
        let trimmed = remaining.trim_start();
        if trimmed.is_empty() {
            return None;
        }
        let eq = trimmed.find('=')?;
        let key = &trimmed[..eq];
        let rest = &trimmed[eq + 1..];
        if key == "name" {
            remaining = "";
            return Some((key, rest));
        }
        match rest.find(' ') {
            Some(sp) => {
                remaining = &rest[sp + 1..];
                Some((key, &rest[..sp]))
            }
            None => {
                remaining = "";
                Some((key, rest))
            }
        }
    })
}

fn parse_num(value: &str, line: &str) -> Result<u64, DecodeError> {
    value
        .parse::<u64>()
        .map_err(|_| DecodeError::MalformedLine(line.to_string()))
}

fn parse_hex(value: &str, line: &str) -> Result<u32, DecodeError> {
    // some posters emit 16 hex digits; the CRC is the low 32 bits
    u64::from_str_radix(value, 16)
        .map(|v| v as u32)
        .map_err(|_| DecodeError::MalformedLine(line.to_string()))
}

/// Decode a complete article body given as raw CRLF-separated lines.
///
/// Convenience for callers that already hold the whole body in memory;
/// the streaming path in the downloader feeds lines as they arrive.
pub fn decode_article(body: &[u8]) -> Result<(DecodedArticle, Vec<u8>), DecodeError> {
    let mut decoder = ArticleDecoder::new();
    let mut out = Vec::new();

    for line in split_lines(body) {
        if decoder.feed_line(line, &mut out)? == LineOutcome::End {
            break;
        }
    }

    let meta = decoder.finish()?;
    Ok((meta, out))
}

/// Split on CRLF (tolerating bare LF), yielding lines without terminators.
fn split_lines(body: &[u8]) -> impl Iterator<Item = &[u8]> {
    body.split(|&b| b == b'\n').filter_map(|line| {
        if line.is_empty() {
            None
        } else {
            Some(line.strip_suffix(b"\r").unwrap_or(line))
        }
    })
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn article_for(payload: &[u8]) -> Vec<u8> {
        encoder::encode_article("file.bin", payload.len() as u64, 1, 0, payload)
    }

    #[test]
    fn round_trip_decodes_what_the_encoder_produced() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let (meta, decoded) = decode_article(&article_for(&payload)).unwrap();

        assert_eq!(decoded, payload);
        assert_eq!(meta.filename, "file.bin");
        assert_eq!(meta.size, payload.len() as u64);
        assert_eq!(meta.offset, 0);

        let mut crc = Crc32::new();
        crc.append(&payload);
        assert_eq!(meta.crc, crc.finish(), "pcrc32 must validate");
    }

    #[test]
    fn multi_part_offset_is_zero_based() {
        let payload = vec![7u8; 100];
        let article = encoder::encode_article("file.bin", 300, 2, 100, &payload);
        let (meta, decoded) = decode_article(&article).unwrap();

        assert_eq!(meta.offset, 100);
        assert_eq!(meta.part, Some(2));
        assert_eq!(decoded.len(), 100);
    }

    #[test]
    fn junk_before_ybegin_is_skipped() {
        let mut body = b"random header noise\r\nanother line\r\n".to_vec();
        body.extend_from_slice(&article_for(b"hello"));
        let (_, decoded) = decode_article(&body).unwrap();
        assert_eq!(decoded, b"hello");
    }

    #[test]
    fn missing_ybegin_is_reported() {
        let err = decode_article(b"just some text\r\nno headers\r\n").unwrap_err();
        assert_eq!(err, DecodeError::MissingYBegin);
    }

    #[test]
    fn missing_yend_is_reported() {
        let article = article_for(b"hello");
        // drop the =yend trailer line
        let cut = article
            .windows(6)
            .position(|w| w == b"=yend ")
            .unwrap();
        let err = decode_article(&article[..cut]).unwrap_err();
        assert_eq!(err, DecodeError::MissingYEnd);
    }

    #[test]
    fn tampered_data_fails_the_crc_check() {
        let mut article = article_for(b"hello world, long enough payload");
        // flip the first data byte after the =ypart line
        let ypart = article.windows(7).position(|w| w == b"=ypart ").unwrap();
        let line_end = ypart
            + article[ypart..].windows(2).position(|w| w == b"\r\n").unwrap()
            + 2;
        article[line_end] = article[line_end].wrapping_add(1);

        let err = decode_article(&article).unwrap_err();
        assert!(
            matches!(err, DecodeError::CrcMismatch { .. })
                || matches!(err, DecodeError::SizeMismatch { .. }),
            "tampering must fail verification, got {err:?}"
        );
    }

    #[test]
    fn declared_size_disagreement_is_size_mismatch() {
        let payload = b"hello";
        let mut article = article_for(payload);
        let text = String::from_utf8(article.clone()).unwrap();
        let patched = text.replace("=yend size=5", "=yend size=6");
        article = patched.into_bytes();

        let err = decode_article(&article).unwrap_err();
        assert_eq!(
            err,
            DecodeError::SizeMismatch {
                declared: 6,
                decoded: 5
            }
        );
    }

    #[test]
    fn name_attribute_preserves_spaces() {
        let header = parse_begin(b"part=1 line=128 size=10 name=My File (1).bin").unwrap();
        assert_eq!(header.name, "My File (1).bin");
    }

    #[test]
    fn malformed_part_range_is_rejected() {
        assert!(parse_part(b"begin=10 end=5").is_err());
        assert!(parse_part(b"begin=0 end=5").is_err());
        assert!(parse_part(b"begin=x end=5").is_err());
    }

    #[test]
    fn sixteen_digit_crc_uses_low_32_bits() {
        let trailer = parse_end(b"size=5 part=1 pcrc32=00000000deadbeef").unwrap();
        assert_eq!(trailer.pcrc32, Some(0xdead_beef));
    }

    #[test]
    fn expected_size_prefers_the_part_range() {
        let mut decoder = ArticleDecoder::new();
        let mut out = Vec::new();
        decoder
            .feed_line(b"=ybegin part=1 line=128 size=300 name=a.bin", &mut out)
            .unwrap();
        assert_eq!(decoder.expected_size(), Some(300));
        decoder.feed_line(b"=ypart begin=101 end=200", &mut out).unwrap();
        assert_eq!(decoder.expected_size(), Some(100));
    }
}
