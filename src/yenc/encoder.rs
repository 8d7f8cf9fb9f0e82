//! yEnc encoder.
//!
//! Produces the same framing the decoder consumes: 128-column lines,
//! escape set `{NUL, LF, CR, '=', SPACE, TAB}`, doubled line-leading dots,
//! `=ybegin`/`=ypart`/`=yend` headers with a `pcrc32` trailer. Used by the
//! test NNTP server and fixtures; kept in the crate proper so round-trip
//! properties can be asserted against the real decoder.

use super::crc::Crc32;

const LINE_LEN: usize = 128;

/// Encode raw bytes into yEnc data lines (no headers), CRLF terminated.
pub fn encode_body(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / LINE_LEN * 2 + 16);
    let mut line_len = 0usize;

    for (idx, &byte) in data.iter().enumerate() {
        let mut ch = byte.wrapping_add(42);
        if matches!(ch, 0 | b'\n' | b'\r' | b'=' | b' ' | b'\t') {
            out.push(b'=');
            line_len += 1;
            ch = ch.wrapping_add(64);
        }
        if ch == b'.' && line_len == 0 {
            out.push(b'.');
            line_len += 1;
        }
        out.push(ch);
        line_len += 1;

        let last = idx + 1 == data.len();
        if line_len >= LINE_LEN || last {
            out.extend_from_slice(b"\r\n");
            line_len = 0;
        }
    }

    out
}

/// A fully framed yEnc article body for one part of a file.
///
/// `offset` is the 0-based byte position of `data` within the final file
/// of `file_size` bytes; the emitted `=ypart` range is 1-based.
pub fn encode_article(
    name: &str,
    file_size: u64,
    part: u32,
    offset: u64,
    data: &[u8],
) -> Vec<u8> {
    let mut crc = Crc32::new();
    crc.append(data);
    let pcrc32 = crc.finish();

    let mut out = Vec::with_capacity(data.len() + 256);
    out.extend_from_slice(
        format!("=ybegin part={part} line={LINE_LEN} size={file_size} name={name}\r\n").as_bytes(),
    );
    out.extend_from_slice(
        format!(
            "=ypart begin={} end={}\r\n",
            offset + 1,
            offset + data.len() as u64
        )
        .as_bytes(),
    );
    out.extend_from_slice(&encode_body(data));
    out.extend_from_slice(
        format!("=yend size={} part={part} pcrc32={pcrc32:08x}\r\n", data.len()).as_bytes(),
    );

    out
}
