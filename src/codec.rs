//! G.711 μ-law codec for the 8 kHz telephony leg.
//!
//! Twilio media streams carry base64 μ-law; the transducers deal in linear
//! PCM i16. Both directions are pure functions with no retained state.

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Input length is not a multiple of the sample width.
    #[error("malformed audio frame: {0} bytes is not a whole number of samples")]
    MalformedFrame(usize),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Decode a μ-law byte to a linear PCM sample.
fn ulaw_to_linear(byte: u8) -> i16 {
    let u = !byte;
    let sign = u & 0x80;
    let exponent = ((u >> 4) & 0x07) as i32;
    let mantissa = (u & 0x0F) as i32;
    let mut sample = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if sign != 0 {
        sample = -sample;
    }
    sample as i16
}

/// Encode a linear PCM sample to a μ-law byte.
fn linear_to_ulaw(sample: i16) -> u8 {
    let sign: u8 = if sample < 0 { 0x80 } else { 0 };
    let mut s = (sample as i32).abs();
    if s > CLIP {
        s = CLIP;
    }
    s += BIAS;
    // s >= BIAS here, so the segment index is always in 0..=7
    let segment = 31 - ((s >> 7) as u32).leading_zeros() as i32;
    let mantissa = ((s >> (segment + 3)) & 0x0F) as u8;
    !(sign | ((segment as u8) << 4) | mantissa)
}

/// Decode μ-law bytes (one byte per sample) to linear PCM.
pub fn decode_mulaw(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| ulaw_to_linear(b)).collect()
}

/// Encode linear PCM to μ-law bytes.
pub fn encode_mulaw(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| linear_to_ulaw(s)).collect()
}

/// Frame linear PCM samples as little-endian bytes for the STT wire.
pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Parse little-endian linear16 bytes back into samples.
///
/// Rejects input whose length is not a multiple of the 2-byte sample
/// width; callers drop the chunk and continue.
pub fn samples_from_le_bytes(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::MalformedFrame(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_round_trips_exactly() {
        assert_eq!(linear_to_ulaw(0), 0xFF);
        assert_eq!(ulaw_to_linear(0xFF), 0);
        assert_eq!(decode_mulaw(&encode_mulaw(&[0, 0, 0])), vec![0, 0, 0]);
    }

    #[test]
    fn round_trip_stays_within_quantization_error() {
        for &s in &[1i16, -1, 100, -100, 1000, -1000, 8000, 20000, -20000, 32000, -32000] {
            let decoded = ulaw_to_linear(linear_to_ulaw(s));
            let err = (decoded as i32 - s as i32).abs();
            // μ-law segments are logarithmic; worst-case step near full scale
            assert!(err <= 1024, "sample {} decoded to {} (err {})", s, decoded, err);
        }
    }

    #[test]
    fn extremes_clip_without_overflow() {
        let hi = ulaw_to_linear(linear_to_ulaw(i16::MAX));
        let lo = ulaw_to_linear(linear_to_ulaw(i16::MIN));
        assert!(hi > 30000);
        assert!(lo < -30000);
    }

    #[test]
    fn sign_symmetry() {
        for &s in &[96i16, 1200, 15000, 31000] {
            assert_eq!(ulaw_to_linear(linear_to_ulaw(s)), -ulaw_to_linear(linear_to_ulaw(-s)));
        }
    }

    #[test]
    fn le_bytes_round_trip() {
        let samples = vec![0i16, 1, -1, 256, -256, i16::MAX, i16::MIN];
        let bytes = samples_to_le_bytes(&samples);
        assert_eq!(samples_from_le_bytes(&bytes).unwrap(), samples);
    }

    #[test]
    fn odd_length_linear_input_is_malformed() {
        let err = samples_from_le_bytes(&[0, 1, 2]).unwrap_err();
        assert!(matches!(err, CodecError::MalformedFrame(3)));
    }
}
