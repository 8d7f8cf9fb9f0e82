//! Scalar yEnc decode kernel.
//!
//! A pure per-byte state machine; the carry state survives chunk and line
//! boundaries so bodies can be decoded as they stream off the socket. The
//! SIMD lanes in [`super::simd`] accelerate clean runs but route every
//! special byte through [`step`], so all variants emit identical output.

/// Carry state between decoded chunks.
///
/// Refers to the previously consumed input:
/// - `LineStart`: the previous bytes were `\r\n` (or nothing yet); a
///   leading `.` on the next byte is dot-unstuffed
/// - `Escape`: the previous byte was `=`
/// - `CarriageReturn`: the previous byte was `\r`
/// - `Middle`: none of the above
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DecodeState {
    /// At the start of a line (after CRLF or at stream start)
    #[default]
    LineStart,
    /// The previous byte was the escape marker `=`
    Escape,
    /// The previous byte was `\r`
    CarriageReturn,
    /// Mid-line
    Middle,
}

/// Advance the state machine by one input byte, appending any decoded
/// output byte to `out`.
#[inline]
pub fn step(state: DecodeState, byte: u8, out: &mut Vec<u8>) -> DecodeState {
    match state {
        DecodeState::Escape => {
            out.push(byte.wrapping_sub(42).wrapping_sub(64));
            if byte == b'\r' {
                DecodeState::CarriageReturn
            } else {
                DecodeState::Middle
            }
        }
        DecodeState::CarriageReturn => {
            if byte == b'\n' {
                DecodeState::LineStart
            } else {
                // lone \r: the pending byte is reprocessed mid-line
                step_middle(byte, out)
            }
        }
        DecodeState::LineStart => {
            if byte == b'.' {
                // dot-stuffed line: drop the first dot
                DecodeState::Middle
            } else {
                step_middle(byte, out)
            }
        }
        DecodeState::Middle => step_middle(byte, out),
    }
}

#[inline]
fn step_middle(byte: u8, out: &mut Vec<u8>) -> DecodeState {
    match byte {
        b'\r' => DecodeState::CarriageReturn,
        b'\n' => DecodeState::Middle,
        b'=' => DecodeState::Escape,
        _ => {
            out.push(byte.wrapping_sub(42));
            DecodeState::Middle
        }
    }
}

/// Decode a chunk of encoded bytes, carrying `state` across calls.
pub fn decode_chunk(src: &[u8], out: &mut Vec<u8>, state: &mut DecodeState) {
    let mut s = *state;
    for &byte in src {
        s = step(s, byte, out);
    }
    *state = s;
}
