//! GUI sounds
//!
//! Short pre-decoded clips mixed on top of the streams. Each sound is
//! converted to the engine's internal format the first time it plays after
//! a format change.

use std::collections::HashMap;

use super::command::SoundRequest;
use super::mixer::{self, Gain};
use crate::buffer::{SamplePacket, StageInput};
use crate::error::{AeError, AeResult};
use crate::resample::{ResampleConfig, ResampleQuality, ResamplerFactory};
use crate::stream::copy_frames;
use crate::types::AudioFormat;

/// Safety net for the flush loop of the one-shot conversion
const MAX_FLUSH_ROUNDS: usize = 256;

struct Sound {
    format: AudioFormat,
    planes: Vec<Vec<u8>>,
    frames: usize,
    converted: Option<SamplePacket>,
}

struct Playing {
    id: u32,
    position: usize,
}

/// Registered sounds and the ones currently playing
#[derive(Default)]
pub(crate) struct SoundBank {
    sounds: HashMap<u32, Sound>,
    playing: Vec<Playing>,
    next_id: u32,
}

fn validate(request: &SoundRequest) -> AeResult<()> {
    let format = &request.format;
    if format.is_raw() {
        return Err(AeError::UnsupportedFormat("bitstream sounds".into()));
    }
    if request.frames == 0 || format.channels() == 0 || format.sample_rate == 0 {
        return Err(AeError::InvalidStream("empty sound".into()));
    }
    let (planes, stride) = if format.planar {
        (format.channels(), format.sample_format.bytes_per_sample())
    } else {
        (1, format.frame_size())
    };
    if request.planes.len() != planes || request.planes.iter().any(|p| p.len() < request.frames * stride) {
        return Err(AeError::InvalidStream("sound data shorter than its frame count".into()));
    }
    Ok(())
}

impl SoundBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sound; returns its id
    pub fn add(&mut self, request: SoundRequest) -> AeResult<u32> {
        validate(&request)?;
        self.next_id += 1;
        let id = self.next_id;
        log::debug!("Engine: sound {} registered ({}, {} frames)", id, request.format, request.frames);
        self.sounds.insert(
            id,
            Sound {
                format: request.format,
                planes: request.planes,
                frames: request.frames,
                converted: None,
            },
        );
        Ok(id)
    }

    pub fn play(&mut self, id: u32) {
        if !self.sounds.contains_key(&id) {
            log::warn!("Engine: play of unknown sound {}", id);
            return;
        }
        self.playing.push(Playing { id, position: 0 });
    }

    pub fn stop(&mut self, id: u32) {
        self.playing.retain(|p| p.id != id);
    }

    pub fn free(&mut self, id: u32) {
        self.stop(id);
        self.sounds.remove(&id);
    }

    pub fn is_playing(&self) -> bool {
        !self.playing.is_empty()
    }

    /// Internal format changed: reconvert on next play, stop what plays
    pub fn invalidate(&mut self) {
        for sound in self.sounds.values_mut() {
            sound.converted = None;
        }
        self.playing.clear();
    }

    /// Mix playing sounds into `dst`; finished sounds stop
    pub fn mix(
        &mut self,
        dst: &mut SamplePacket,
        factory: ResamplerFactory,
        quality: ResampleQuality,
    ) -> bool {
        if self.playing.is_empty() || !dst.is_float_planar() {
            return false;
        }
        let target = dst.format().clone();
        let max_frames = dst.nb_samples;
        let mut overflow = false;
        let sounds = &mut self.sounds;

        self.playing.retain_mut(|playing| {
            let Some(sound) = sounds.get_mut(&playing.id) else {
                return false;
            };
            if sound.converted.is_none() {
                match convert(sound, &target, factory, quality) {
                    Ok(pkt) => sound.converted = Some(pkt),
                    Err(e) => {
                        log::warn!("Engine: sound {} conversion failed: {}", playing.id, e);
                        return false;
                    }
                }
            }
            let Some(pkt) = sound.converted.as_ref() else {
                return false;
            };
            let frames = (pkt.nb_samples - playing.position.min(pkt.nb_samples)).min(max_frames);
            overflow |= mixer::mix_into(dst, pkt, playing.position, frames, Gain::Uniform(1.0));
            playing.position += frames;
            playing.position < pkt.nb_samples
        });

        if overflow {
            mixer::clamp(dst);
        }
        true
    }
}

/// One-shot conversion of a sound to `target`
fn convert(
    sound: &Sound,
    target: &AudioFormat,
    factory: ResamplerFactory,
    quality: ResampleQuality,
) -> AeResult<SamplePacket> {
    let staging_format = AudioFormat::internal(sound.format.sample_rate, sound.format.layout.clone(), sound.frames);
    let mut staging = SamplePacket::new(&staging_format, sound.frames);
    let planes: Vec<&[u8]> = sound.planes.iter().map(|p| p.as_slice()).collect();
    copy_frames(&sound.format, &planes, 0, sound.frames, &mut staging);

    let expected = sound.frames as u64 * target.sample_rate as u64 / sound.format.sample_rate as u64;
    let capacity = expected as usize + 64;
    let output_format = AudioFormat::internal(target.sample_rate, target.layout.clone(), capacity);
    let mut out = SamplePacket::new(&output_format, capacity);

    let mut resampler = factory(&ResampleConfig {
        input: staging_format,
        output: output_format,
        quality,
        upmix: false,
        normalize: true,
        centre_mix_level: None,
    })?;

    let produced = resampler.resample(&mut out, capacity, StageInput::Data(&staging), 1.0)?;
    out.nb_samples += produced;
    for _ in 0..MAX_FLUSH_ROUNDS {
        let free = out.free_samples();
        if free == 0 {
            break;
        }
        let produced = resampler.resample(&mut out, free, StageInput::Flush, 1.0)?;
        if produced == 0 {
            break;
        }
        out.nb_samples += produced;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resample::create_resampler;
    use crate::types::{ChannelLayout, SampleFormat};

    fn request(rate: u32, frames: usize, value: f32) -> SoundRequest {
        let format = AudioFormat::pcm(SampleFormat::F32, rate, ChannelLayout::mono());
        let bytes = (0..frames).flat_map(|_| value.to_ne_bytes()).collect();
        SoundRequest {
            format,
            planes: vec![bytes],
            frames,
        }
    }

    fn output(frames: usize) -> SamplePacket {
        let fmt = AudioFormat::internal(48000, ChannelLayout::stereo(), frames);
        let mut pkt = SamplePacket::new(&fmt, frames);
        pkt.nb_samples = frames;
        pkt
    }

    #[test]
    fn test_rejects_short_data() {
        let mut bank = SoundBank::new();
        let mut req = request(48000, 10, 0.1);
        req.frames = 20;
        assert!(bank.add(req).is_err());
    }

    #[test]
    fn test_sound_plays_to_the_end() {
        let mut bank = SoundBank::new();
        let id = bank.add(request(48000, 300, 0.25)).unwrap();
        bank.play(id);

        let mut first = output(256);
        assert!(bank.mix(&mut first, create_resampler, ResampleQuality::Medium));
        assert!(first.plane(0)[0] > 0.1);
        assert!(bank.is_playing());

        let mut second = output(256);
        bank.mix(&mut second, create_resampler, ResampleQuality::Medium);
        assert!(second.plane(0)[40] > 0.1);
        assert_eq!(second.plane(0)[100], 0.0);
        assert!(!bank.is_playing());
    }

    #[test]
    fn test_stop_and_free() {
        let mut bank = SoundBank::new();
        let id = bank.add(request(48000, 100, 0.1)).unwrap();
        bank.play(id);
        bank.stop(id);
        assert!(!bank.is_playing());
        bank.free(id);
        bank.play(id);
        assert!(!bank.is_playing());
    }

    #[test]
    fn test_resampled_sound_length() {
        let mut bank = SoundBank::new();
        let id = bank.add(request(24000, 1200, 0.2)).unwrap();
        bank.play(id);
        let mut played = 0;
        for _ in 0..20 {
            let mut pkt = output(480);
            bank.mix(&mut pkt, create_resampler, ResampleQuality::Low);
            played += 480;
            if !bank.is_playing() {
                break;
            }
        }
        assert!(!bank.is_playing());
        assert!(played >= 2400 && played <= 2880);
    }
}
