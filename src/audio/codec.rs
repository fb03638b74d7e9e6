//! # PCM16 / Base64 Codec
//!
//! Conversion between the f32 samples the audio graph works with and the
//! wire format of the remote session.
//!
//! ## Wire format:
//! - **Encoding**: signed 16-bit little-endian PCM, mono
//! - **Transport**: standard base64 (with padding)
//! - **Outbound rate**: declared in the mime type, e.g. `audio/pcm;rate=16000`
//! - **Inbound rate**: fixed by the remote session (24kHz), not declared per chunk
//!
//! ## Scaling:
//! Both directions use a scale of 32768. Encoding rounds and saturates, so
//! `decode(encode(x))` is within 1/32768 of `clamp(x, -1, 1)` for every input.

use crate::transport::messages::MediaBlob;
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

const PCM_SCALE: f32 = 32768.0;

/// Mime type for outbound PCM at the given rate.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Convert float samples to 16-bit PCM.
///
/// Out-of-range input is clamped to [-1.0, 1.0] first; NaN encodes as silence.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
            (clamped * PCM_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
        })
        .collect()
}

/// Convert 16-bit PCM samples to floats in [-1.0, 1.0).
pub fn pcm16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / PCM_SCALE).collect()
}

/// Serialize samples as little-endian bytes.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// Parse little-endian PCM16. A trailing odd byte is ignored.
pub fn bytes_to_pcm16(bytes: &[u8]) -> Vec<i16> {
    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    samples
}

/// Encode one capture block into the outbound media blob.
pub fn create_media_blob(samples: &[f32], sample_rate: u32) -> MediaBlob {
    let bytes = pcm16_to_bytes(&float_to_pcm16(samples));
    MediaBlob {
        data: STANDARD.encode(bytes),
        mime_type: pcm_mime_type(sample_rate),
    }
}

/// Decode one inbound base64 audio chunk into playable samples.
pub fn decode_audio_chunk(data: &str) -> Result<Vec<f32>> {
    let bytes = STANDARD
        .decode(data.trim())
        .context("audio chunk is not valid base64")?;
    Ok(pcm16_to_float(&bytes_to_pcm16(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_error_bound() {
        let bound = 1.0 / 32768.0;
        let mut x = -1.25f32;
        while x <= 1.25 {
            let decoded = pcm16_to_float(&float_to_pcm16(&[x]))[0];
            let expected = x.clamp(-1.0, 1.0);
            assert!(
                (decoded - expected).abs() <= bound + f32::EPSILON,
                "{} decoded as {}",
                x,
                decoded
            );
            x += 0.000_37;
        }
    }

    #[test]
    fn test_extremes_saturate() {
        assert_eq!(float_to_pcm16(&[1.0, -1.0, 7.5, -7.5, f32::NAN]), vec![32767, -32768, 32767, -32768, 0]);
    }

    #[test]
    fn test_bytes_are_little_endian() {
        assert_eq!(pcm16_to_bytes(&[1, -2]), vec![0x01, 0x00, 0xFE, 0xFF]);
        assert_eq!(bytes_to_pcm16(&[0x01, 0x00, 0xFE, 0xFF, 0x7F]), vec![1, -2]);
    }

    #[test]
    fn test_media_blob() {
        let blob = create_media_blob(&[0.0, 0.5], 16_000);
        assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
        // 0 -> 00 00, 16384 -> 00 40
        assert_eq!(blob.data, STANDARD.encode([0x00, 0x00, 0x00, 0x40]));
    }

    #[test]
    fn test_decode_chunk() {
        let data = STANDARD.encode([0x00, 0x40, 0x00, 0xC0, 0x11]);
        assert_eq!(decode_audio_chunk(&data).unwrap(), vec![0.5, -0.5]);
        assert!(decode_audio_chunk("***").is_err());
        assert!(decode_audio_chunk("").unwrap().is_empty());
    }
}
