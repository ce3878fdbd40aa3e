//! Binary waveform file encoding.
//!
//! [`AwgFileCodec`] layout, all little-endian:
//!
//! ```text
//! magic "QAWG" | version u16 | sample_rate f64
//! n_channels u16 | n_channels × (channel u32, amplitude f64, offset f64)
//! n_entries u32  | n_entries × (trigger_wait u8, play_count u32,
//!                               event_jump u32, goto u32, n_samples u32)
//! n_entries × n_channels × n_samples × word u16
//! ```
//!
//! Each word holds a 14-bit DAC code in bits 0..=13 spanning
//! `offset ± amplitude / 2`, marker 1 in bit 14 and marker 2 in bit 15.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use qdaq_core::limits::DAC_BITS;
use qdaq_core::SequenceError;

use crate::blueprint::RenderedChannel;
use crate::upload::{SequenceTableEntry, UploadPackage};

const MAGIC: &[u8; 4] = b"QAWG";
const VERSION: u16 = 1;
const CODE_MASK: u16 = (1 << DAC_BITS) - 1;
const MARKER1_BIT: u16 = 1 << 14;
const MARKER2_BIT: u16 = 1 << 15;

/// Serializes an [`UploadPackage`] into a generator file and back.
pub trait WaveformEncoder: Send + Sync {
    /// File extension the generator expects.
    fn file_extension(&self) -> &'static str;

    /// Encode a package.
    fn encode(&self, package: &UploadPackage) -> Result<Bytes, SequenceError>;

    /// Decode a file produced by [`WaveformEncoder::encode`].
    fn decode(&self, data: &[u8]) -> Result<UploadPackage, SequenceError>;
}

/// Reference 14-bit waveform file format.
#[derive(Debug, Clone, Copy, Default)]
pub struct AwgFileCodec;

impl AwgFileCodec {
    /// Voltage of one DAC step for a channel amplitude.
    pub fn lsb(amplitude: f64) -> f64 {
        amplitude / f64::from(CODE_MASK)
    }

    fn to_code(value: f64, amplitude: f64, offset: f64) -> u16 {
        if amplitude <= 0.0 {
            return 0;
        }
        let low = offset - amplitude / 2.0;
        let code = ((value - low) / amplitude * f64::from(CODE_MASK)).round();
        code.clamp(0.0, f64::from(CODE_MASK)) as u16
    }

    fn from_code(code: u16, amplitude: f64, offset: f64) -> f64 {
        offset - amplitude / 2.0 + f64::from(code) * Self::lsb(amplitude)
    }
}

fn encoding(msg: impl Into<String>) -> SequenceError {
    SequenceError::Encoding(msg.into())
}

fn ensure(buf: &[u8], n: usize, what: &str) -> Result<(), SequenceError> {
    if buf.remaining() < n {
        return Err(encoding(format!(
            "truncated file: need {} bytes for {}, {} left",
            n,
            what,
            buf.remaining()
        )));
    }
    Ok(())
}

fn to_u32(value: usize, what: &str) -> Result<u32, SequenceError> {
    u32::try_from(value).map_err(|_| encoding(format!("{} {} does not fit in 32 bits", what, value)))
}

impl WaveformEncoder for AwgFileCodec {
    fn file_extension(&self) -> &'static str {
        "qawg"
    }

    fn encode(&self, package: &UploadPackage) -> Result<Bytes, SequenceError> {
        let n_channels = u16::try_from(package.channels.len())
            .map_err(|_| encoding("too many channels"))?;
        if package.table.len() != package.waveforms.len() {
            return Err(encoding("sequence table and waveforms disagree in length"));
        }

        let mut buf = BytesMut::with_capacity(64 + package.samples_per_channel() * 2);
        buf.put_slice(MAGIC);
        buf.put_u16_le(VERSION);
        buf.put_f64_le(package.sample_rate);

        buf.put_u16_le(n_channels);
        for (index, channel) in package.channels.iter().enumerate() {
            buf.put_u32_le(*channel);
            buf.put_f64_le(package.amplitudes[index]);
            buf.put_f64_le(package.offsets[index]);
        }

        buf.put_u32_le(to_u32(package.table.len(), "entry count")?);
        for (entry, row) in package.table.iter().zip(&package.waveforms) {
            let n_samples = row.first().map(RenderedChannel::len).unwrap_or(0);
            if row.len() != package.channels.len() || row.iter().any(|w| w.len() != n_samples) {
                return Err(encoding("element waveforms differ in length or channel count"));
            }
            buf.put_u8(u8::from(entry.trigger_wait));
            buf.put_u32_le(entry.play_count);
            buf.put_u32_le(to_u32(entry.event_jump, "event jump")?);
            buf.put_u32_le(to_u32(entry.goto, "goto")?);
            buf.put_u32_le(to_u32(n_samples, "sample count")?);
        }

        for row in &package.waveforms {
            for (index, waveform) in row.iter().enumerate() {
                let (amplitude, offset) = (package.amplitudes[index], package.offsets[index]);
                for (k, value) in waveform.samples.iter().enumerate() {
                    let mut word = Self::to_code(*value, amplitude, offset);
                    if waveform.marker1.get(k).copied().unwrap_or(false) {
                        word |= MARKER1_BIT;
                    }
                    if waveform.marker2.get(k).copied().unwrap_or(false) {
                        word |= MARKER2_BIT;
                    }
                    buf.put_u16_le(word);
                }
            }
        }
        Ok(buf.freeze())
    }

    fn decode(&self, data: &[u8]) -> Result<UploadPackage, SequenceError> {
        let mut buf = data;
        ensure(buf, 4 + 2 + 8 + 2, "header")?;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if &magic != MAGIC {
            return Err(encoding("bad magic"));
        }
        let version = buf.get_u16_le();
        if version != VERSION {
            return Err(encoding(format!("unsupported version {}", version)));
        }
        let sample_rate = buf.get_f64_le();

        let n_channels = usize::from(buf.get_u16_le());
        ensure(buf, n_channels * 20, "channel table")?;
        let mut channels = Vec::with_capacity(n_channels);
        let mut amplitudes = Vec::with_capacity(n_channels);
        let mut offsets = Vec::with_capacity(n_channels);
        for _ in 0..n_channels {
            channels.push(buf.get_u32_le());
            amplitudes.push(buf.get_f64_le());
            offsets.push(buf.get_f64_le());
        }

        ensure(buf, 4, "entry count")?;
        let n_entries = buf.get_u32_le() as usize;
        ensure(buf, n_entries * 17, "sequence table")?;
        let mut table = Vec::with_capacity(n_entries);
        let mut lengths = Vec::with_capacity(n_entries);
        for _ in 0..n_entries {
            table.push(SequenceTableEntry {
                trigger_wait: buf.get_u8() != 0,
                play_count: buf.get_u32_le(),
                event_jump: buf.get_u32_le() as usize,
                goto: buf.get_u32_le() as usize,
            });
            lengths.push(buf.get_u32_le() as usize);
        }

        let mut waveforms = Vec::with_capacity(n_entries);
        for n_samples in lengths {
            let mut row = Vec::with_capacity(n_channels);
            for index in 0..n_channels {
                ensure(buf, n_samples * 2, "waveform data")?;
                let mut waveform = RenderedChannel {
                    samples: Vec::with_capacity(n_samples),
                    marker1: Vec::with_capacity(n_samples),
                    marker2: Vec::with_capacity(n_samples),
                };
                for _ in 0..n_samples {
                    let word = buf.get_u16_le();
                    waveform.samples.push(Self::from_code(
                        word & CODE_MASK,
                        amplitudes[index],
                        offsets[index],
                    ));
                    waveform.marker1.push(word & MARKER1_BIT != 0);
                    waveform.marker2.push(word & MARKER2_BIT != 0);
                }
                row.push(waveform);
            }
            waveforms.push(row);
        }
        if buf.has_remaining() {
            return Err(encoding(format!("{} trailing bytes", buf.remaining())));
        }

        Ok(UploadPackage {
            sample_rate,
            channels,
            waveforms,
            table,
            amplitudes,
            offsets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_extremes() {
        assert_eq!(AwgFileCodec::to_code(-0.25, 0.5, 0.0), 0);
        assert_eq!(AwgFileCodec::to_code(0.25, 0.5, 0.0), CODE_MASK);
        assert_eq!(AwgFileCodec::to_code(9.0, 0.5, 0.0), CODE_MASK);
        let mid = AwgFileCodec::from_code(AwgFileCodec::to_code(0.0, 0.5, 0.0), 0.5, 0.0);
        assert!(mid.abs() <= AwgFileCodec::lsb(0.5));
    }

    #[test]
    fn test_rejects_garbage() {
        let codec = AwgFileCodec;
        assert!(matches!(
            codec.decode(b"NOPE\x01\x00"),
            Err(SequenceError::Encoding(_))
        ));
        assert!(matches!(
            codec.decode(b"QAWG"),
            Err(SequenceError::Encoding(_))
        ));
    }
}
