//! SIMD-accelerated yEnc decoding.
//!
//! Encoded bodies are almost entirely plain shifted bytes; escapes and line
//! framing are rare. The fast path scans 16-byte lanes for the next special
//! byte (`=`, `\r`, `\n`) and bulk-subtracts 42 from the clean run in
//! between. Special bytes and all non-`Middle` states route through the
//! scalar [`step`](super::scalar::step), so every lane produces output
//! byte-identical to the scalar kernel.
//!
//! Lanes: SSE2 (baseline x86_64), SSSE3 (runtime-detected recompile of the
//! same kernel), NEON (baseline aarch64), scalar elsewhere.

use super::scalar::{self, DecodeState};

/// Decode a chunk of encoded bytes using the best available lane,
/// carrying `state` across calls.
pub fn decode_chunk(src: &[u8], out: &mut Vec<u8>, state: &mut DecodeState) {
    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("ssse3") {
            // SAFETY: ssse3 presence checked above
            unsafe { decode_chunk_ssse3(src, out, state) }
        } else {
            decode_chunk_sse2(src, out, state);
        }
        return;
    }

    #[cfg(target_arch = "aarch64")]
    {
        decode_chunk_neon(src, out, state);
        return;
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        scalar::decode_chunk(src, out, state);
    }
}

/// Shared skeleton: vectorized clean runs, scalar everything else.
macro_rules! lane_loop {
    ($src:expr, $out:expr, $state:expr, $find:expr, $sub:expr) => {{
        let src: &[u8] = $src;
        let out: &mut Vec<u8> = $out;
        let state: &mut DecodeState = $state;
        let len = src.len();
        let mut i = 0;
        while i < len {
            if *state == DecodeState::Middle {
                let run = match $find(&src[i..]) {
                    Some(rel) => rel,
                    None => len - i,
                };
                if run > 0 {
                    $sub(&src[i..i + run], out);
                    i += run;
                    continue;
                }
            }
            *state = scalar::step(*state, src[i], out);
            i += 1;
        }
    }};
}

#[cfg(target_arch = "x86_64")]
fn decode_chunk_sse2(src: &[u8], out: &mut Vec<u8>, state: &mut DecodeState) {
    lane_loop!(src, out, state, find_special_sse2, sub42_sse2);
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "ssse3")]
unsafe fn decode_chunk_ssse3(src: &[u8], out: &mut Vec<u8>, state: &mut DecodeState) {
    lane_loop!(src, out, state, find_special_sse2, sub42_sse2);
}

/// Index of the first `=`, `\r` or `\n` in `src`, or None.
#[cfg(target_arch = "x86_64")]
#[inline]
fn find_special_sse2(src: &[u8]) -> Option<usize> {
    use std::arch::x86_64::*;

    let len = src.len();
    let chunks = len / 16;

    // SAFETY: loads stay within src; SSE2 is baseline on x86_64
    unsafe {
        let eq = _mm_set1_epi8(b'=' as i8);
        let cr = _mm_set1_epi8(b'\r' as i8);
        let lf = _mm_set1_epi8(b'\n' as i8);

        for c in 0..chunks {
            let ptr = src.as_ptr().add(c * 16) as *const __m128i;
            let input = _mm_loadu_si128(ptr);
            let hits = _mm_or_si128(
                _mm_cmpeq_epi8(input, eq),
                _mm_or_si128(_mm_cmpeq_epi8(input, cr), _mm_cmpeq_epi8(input, lf)),
            );
            let mask = _mm_movemask_epi8(hits) as u32;
            if mask != 0 {
                return Some(c * 16 + mask.trailing_zeros() as usize);
            }
        }
    }

    src[chunks * 16..]
        .iter()
        .position(|&b| matches!(b, b'=' | b'\r' | b'\n'))
        .map(|rel| chunks * 16 + rel)
}

/// Append `src` with 42 subtracted from every byte.
#[cfg(target_arch = "x86_64")]
#[inline]
fn sub42_sse2(src: &[u8], out: &mut Vec<u8>) {
    use std::arch::x86_64::*;

    let len = src.len();
    let start = out.len();
    let chunks = len / 16;
    let simd_len = chunks * 16;

    if chunks > 0 {
        out.resize(start + simd_len, 0);

        // SAFETY: out was resized to hold simd_len bytes; loads stay in src
        unsafe {
            let shift = _mm_set1_epi8(42);
            for c in 0..chunks {
                let input = _mm_loadu_si128(src.as_ptr().add(c * 16) as *const __m128i);
                let result = _mm_sub_epi8(input, shift);
                _mm_storeu_si128(out.as_mut_ptr().add(start + c * 16) as *mut __m128i, result);
            }
        }
    }

    for &byte in &src[simd_len..] {
        out.push(byte.wrapping_sub(42));
    }
}

#[cfg(target_arch = "aarch64")]
fn decode_chunk_neon(src: &[u8], out: &mut Vec<u8>, state: &mut DecodeState) {
    lane_loop!(src, out, state, find_special_neon, sub42_neon);
}

/// Index of the first `=`, `\r` or `\n` in `src`, or None.
#[cfg(target_arch = "aarch64")]
#[inline]
fn find_special_neon(src: &[u8]) -> Option<usize> {
    use std::arch::aarch64::*;

    let len = src.len();
    let chunks = len / 16;

    // SAFETY: loads stay within src; NEON is baseline on aarch64
    unsafe {
        let eq = vdupq_n_u8(b'=');
        let cr = vdupq_n_u8(b'\r');
        let lf = vdupq_n_u8(b'\n');

        for c in 0..chunks {
            let input = vld1q_u8(src.as_ptr().add(c * 16));
            let hits = vorrq_u8(
                vceqq_u8(input, eq),
                vorrq_u8(vceqq_u8(input, cr), vceqq_u8(input, lf)),
            );
            if vmaxvq_u8(hits) != 0 {
                // narrow down inside the hit lane
                let base = c * 16;
                for (rel, &b) in src[base..base + 16].iter().enumerate() {
                    if matches!(b, b'=' | b'\r' | b'\n') {
                        return Some(base + rel);
                    }
                }
            }
        }
    }

    src[chunks * 16..]
        .iter()
        .position(|&b| matches!(b, b'=' | b'\r' | b'\n'))
        .map(|rel| chunks * 16 + rel)
}

/// Append `src` with 42 subtracted from every byte.
#[cfg(target_arch = "aarch64")]
#[inline]
fn sub42_neon(src: &[u8], out: &mut Vec<u8>) {
    use std::arch::aarch64::*;

    let len = src.len();
    let start = out.len();
    let chunks = len / 16;
    let simd_len = chunks * 16;

    if chunks > 0 {
        out.resize(start + simd_len, 0);

        // SAFETY: out was resized to hold simd_len bytes; loads stay in src
        unsafe {
            let shift = vdupq_n_u8(42);
            for c in 0..chunks {
                let input = vld1q_u8(src.as_ptr().add(c * 16));
                let result = vsubq_u8(input, shift);
                vst1q_u8(out.as_mut_ptr().add(start + c * 16), result);
            }
        }
    }

    for &byte in &src[simd_len..] {
        out.push(byte.wrapping_sub(42));
    }
}
