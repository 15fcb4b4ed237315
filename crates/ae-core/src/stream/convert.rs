//! Producer sample formats to the internal representation

use crate::buffer::SamplePacket;
use crate::types::{AudioFormat, SampleFormat};

/// Read one sample at `pos` of `bytes` as float
fn read_sample(format: SampleFormat, bytes: &[u8], pos: usize) -> f32 {
    match format {
        SampleFormat::U8 => (bytes[pos] as f32 - 128.0) / 128.0,
        SampleFormat::S16 => i16::from_ne_bytes([bytes[pos], bytes[pos + 1]]) as f32 / 32768.0,
        SampleFormat::S32 => {
            let v = i32::from_ne_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]);
            (v as f64 / 2_147_483_648.0) as f32
        }
        SampleFormat::F32 => {
            f32::from_ne_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
        }
        SampleFormat::F64 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[pos..pos + 8]);
            f64::from_ne_bytes(raw) as f32
        }
        SampleFormat::Raw(_) => 0.0,
    }
}

/// Copy `frames` frames starting at frame `src_offset` of `planes` into
/// `dst` after its current content
///
/// PCM of any supported format or interleaving lands as planar float.
/// Bitstream data is copied byte for byte.
pub fn copy_frames(
    src_format: &AudioFormat,
    planes: &[&[u8]],
    src_offset: usize,
    frames: usize,
    dst: &mut SamplePacket,
) {
    let start = dst.nb_samples;

    if src_format.is_raw() {
        let frame_size = src_format.frame_size();
        let src = &planes[0][src_offset * frame_size..(src_offset + frames) * frame_size];
        dst.bytes_mut(0)[start * frame_size..(start + frames) * frame_size].copy_from_slice(src);
        dst.nb_samples += frames;
        return;
    }

    let channels = src_format.channels();
    let bps = src_format.sample_format.bytes_per_sample();
    let sample_format = src_format.sample_format;

    if src_format.planar {
        for (c, &plane) in planes.iter().enumerate().take(channels) {
            let out = &mut dst.plane_mut(c)[start..start + frames];
            for (f, o) in out.iter_mut().enumerate() {
                *o = read_sample(sample_format, plane, (src_offset + f) * bps);
            }
        }
    } else {
        let src = planes[0];
        for c in 0..channels {
            let out = &mut dst.plane_mut(c)[start..start + frames];
            for (f, o) in out.iter_mut().enumerate() {
                *o = read_sample(sample_format, src, ((src_offset + f) * channels + c) * bps);
            }
        }
    }
    dst.nb_samples += frames;
}

/// Bytes a producer must supply per frame and plane
pub fn producer_stride(format: &AudioFormat) -> usize {
    if format.planar {
        format.sample_format.bytes_per_sample()
    } else {
        format.frame_size()
    }
}
