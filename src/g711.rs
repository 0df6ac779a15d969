//! G.711 μ-law (PCMU) codec.
//!
//! Encoding works in the 14-bit magnitude domain of the G.711 reference
//! implementation: 16-bit input is shifted down two bits, clipped, biased by
//! 33 and split into a 3-bit segment and a 4-bit mantissa. Decoding returns
//! samples in the full 16-bit working range.

use crate::rtp::SAMPLES_PER_FRAME;

/// μ-law byte that decodes to linear zero.
pub const SILENCE: u8 = 0xFF;

const BIAS: i16 = 0x21;
const CLIP: i16 = 8159;
const DECODE_BIAS: i16 = 0x84;

/// Encode one 16-bit linear PCM sample to μ-law.
pub fn encode_sample(sample: i16) -> u8 {
    let mut pcm = sample >> 2;

    // Sign is folded into the final complement mask
    let mask: u8 = if pcm < 0 {
        pcm = -pcm;
        0x7F
    } else {
        0xFF
    };

    if pcm > CLIP {
        pcm = CLIP;
    }
    pcm += BIAS;

    // Highest set bit above the biased floor of 0x20 selects the segment
    let bits = 16 - (pcm as u16).leading_zeros();
    let segment = bits.saturating_sub(6);
    if segment > 7 {
        return 0x7F ^ mask;
    }

    let mantissa = ((pcm >> (segment + 1)) & 0x0F) as u8;
    (((segment as u8) << 4) | mantissa) ^ mask
}

/// Decode one μ-law byte to 16-bit linear PCM.
pub fn decode_sample(ulaw: u8) -> i16 {
    let ulaw = !ulaw;
    let segment = (ulaw & 0x70) >> 4;
    let magnitude = ((((ulaw & 0x0F) as i16) << 3) + DECODE_BIAS) << segment;

    if ulaw & 0x80 != 0 {
        DECODE_BIAS - magnitude
    } else {
        magnitude - DECODE_BIAS
    }
}

pub fn encode(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| encode_sample(s)).collect()
}

pub fn decode(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| decode_sample(b)).collect()
}

/// Decode an RTP payload, padding a truncated payload with silence up to the
/// next whole frame instead of rejecting it.
pub fn decode_frame(payload: &[u8]) -> Vec<i16> {
    let remainder = payload.len() % SAMPLES_PER_FRAME;
    if remainder == 0 {
        return decode(payload);
    }

    let mut padded = Vec::with_capacity(payload.len() + SAMPLES_PER_FRAME - remainder);
    padded.extend_from_slice(payload);
    padded.resize(payload.len() + SAMPLES_PER_FRAME - remainder, SILENCE);
    decode(&padded)
}
