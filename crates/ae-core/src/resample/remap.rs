//! Channel remapping matrix (downmix / upmix)

use crate::types::{Channel, ChannelLayout, Sample};

/// -3dB, used when one speaker is folded into a pair
const FOLD_LEVEL: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Mixing matrix from an input layout to an output layout
///
/// `rows[out][in]` is the gain of input channel `in` in output channel `out`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemapMatrix {
    rows: Vec<Vec<f32>>,
    identity: bool,
}

impl RemapMatrix {
    /// Build the matrix for `input` → `output`
    ///
    /// With `upmix`, output speakers nothing maps to are synthesised from the
    /// front pair. With `normalize`, the matrix is scaled so no output
    /// channel can exceed full scale.
    pub fn build(
        input: &ChannelLayout,
        output: &ChannelLayout,
        upmix: bool,
        normalize: bool,
        centre_mix_level: Option<f32>,
    ) -> Self {
        let in_count = input.count();
        let mut rows = vec![vec![0.0f32; in_count]; output.count()];

        for (i, &ch) in input.channels().iter().enumerate() {
            if let Some(o) = output.index_of(ch) {
                rows[o][i] = 1.0;
                continue;
            }
            let level = if ch == Channel::FC {
                centre_mix_level.unwrap_or(FOLD_LEVEL)
            } else {
                FOLD_LEVEL
            };
            for target in fold_targets(ch, output) {
                if let Some(o) = output.index_of(target) {
                    rows[o][i] += level;
                }
            }
        }

        if upmix {
            for (o, &ch) in output.channels().iter().enumerate() {
                if rows[o].iter().any(|&g| g != 0.0) {
                    continue;
                }
                for &(source, gain) in upmix_sources(ch) {
                    if let Some(i) = input.index_of(source) {
                        rows[o][i] += gain;
                    }
                }
            }
        }

        if normalize {
            let max_sum = rows
                .iter()
                .map(|row| row.iter().map(|g| g.abs()).sum::<f32>())
                .fold(0.0f32, f32::max);
            if max_sum > 1.0 {
                for gain in rows.iter_mut().flat_map(|row| row.iter_mut()) {
                    *gain /= max_sum;
                }
            }
        }

        let identity = input == output
            && rows
                .iter()
                .enumerate()
                .all(|(o, row)| row.iter().enumerate().all(|(i, &g)| g == if i == o { 1.0 } else { 0.0 }));

        Self { rows, identity }
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    pub fn output_channels(&self) -> usize {
        self.rows.len()
    }

    /// Mix `frames` frames of `src` and append them to `dst`
    pub fn apply(&self, src: &[&[Sample]], frames: usize, dst: &mut [Vec<Sample>]) {
        if self.identity {
            for (plane, out) in src.iter().zip(dst.iter_mut()) {
                out.extend_from_slice(&plane[..frames]);
            }
            return;
        }

        for (row, out) in self.rows.iter().zip(dst.iter_mut()) {
            let start = out.len();
            out.resize(start + frames, 0.0);
            let out = &mut out[start..];
            for (&gain, plane) in row.iter().zip(src.iter()) {
                if gain == 0.0 {
                    continue;
                }
                for (o, &s) in out.iter_mut().zip(plane[..frames].iter()) {
                    *o += s * gain;
                }
            }
        }
    }
}

/// Speakers a missing input speaker is folded into, first match wins
fn fold_targets(ch: Channel, output: &ChannelLayout) -> Vec<Channel> {
    use Channel::*;
    let candidates: &[&[Channel]] = match ch {
        FC => &[&[FL, FR]],
        BL => &[&[SL], &[FL]],
        BR => &[&[SR], &[FR]],
        SL => &[&[BL], &[FL]],
        SR => &[&[BR], &[FR]],
        BC => &[&[BL, BR], &[SL, SR], &[FL, FR]],
        FL | FR => &[&[FC]],
        LFE => &[],
    };
    candidates
        .iter()
        .find(|group| group.iter().all(|c| output.contains(*c)))
        .map(|group| group.to_vec())
        .unwrap_or_default()
}

/// Where an otherwise silent output speaker takes its signal from when upmixing
fn upmix_sources(ch: Channel) -> &'static [(Channel, f32)] {
    use Channel::*;
    match ch {
        FC | BC => &[(FL, 0.5), (FR, 0.5)],
        BL | SL => &[(FL, 1.0)],
        BR | SR => &[(FR, 1.0)],
        FL | FR | LFE => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StdLayout;

    #[test]
    fn test_identity() {
        let stereo = ChannelLayout::stereo();
        let m = RemapMatrix::build(&stereo, &stereo, false, true, None);
        assert!(m.is_identity());

        let l = [0.25f32, 0.5];
        let r = [-0.25f32, -0.5];
        let mut out = vec![Vec::new(), Vec::new()];
        m.apply(&[&l, &r], 2, &mut out);
        assert_eq!(out[0], l);
        assert_eq!(out[1], r);
    }

    #[test]
    fn test_mono_to_stereo_folds_centre() {
        let m = RemapMatrix::build(&ChannelLayout::mono(), &ChannelLayout::stereo(), false, false, None);
        let c = [1.0f32];
        let mut out = vec![Vec::new(), Vec::new()];
        m.apply(&[&c], 1, &mut out);
        assert!((out[0][0] - FOLD_LEVEL).abs() < 1e-6);
        assert!((out[1][0] - FOLD_LEVEL).abs() < 1e-6);
    }

    #[test]
    fn test_downmix_normalized_never_clips() {
        let input = StdLayout::L5_1.layout();
        let m = RemapMatrix::build(&input, &ChannelLayout::stereo(), false, true, None);
        let full = [1.0f32];
        let planes: Vec<&[f32]> = (0..input.count()).map(|_| &full[..]).collect();
        let mut out = vec![Vec::new(), Vec::new()];
        m.apply(&planes, 1, &mut out);
        assert!(out[0][0] <= 1.0 + 1e-6);
        assert!(out[1][0] <= 1.0 + 1e-6);
    }

    #[test]
    fn test_upmix_feeds_rear() {
        let output = StdLayout::L4_0.layout();
        let m = RemapMatrix::build(&ChannelLayout::stereo(), &output, true, false, None);
        let l = [0.5f32];
        let r = [0.25f32];
        let mut out = vec![Vec::new(); 4];
        m.apply(&[&l, &r], 1, &mut out);
        assert_eq!(out[2][0], 0.5); // BL
        assert_eq!(out[3][0], 0.25); // BR
    }

    #[test]
    fn test_upmix_centre_from_both_fronts() {
        let output = StdLayout::L5_1.layout();
        let m = RemapMatrix::build(&ChannelLayout::stereo(), &output, true, false, None);
        let l = [0.5f32];
        let r = [0.25f32];
        let mut out = vec![Vec::new(); output.count()];
        m.apply(&[&l, &r], 1, &mut out);
        let fc = output.index_of(Channel::FC).unwrap();
        let lfe = output.index_of(Channel::LFE).unwrap();
        assert!((out[fc][0] - 0.375).abs() < 1e-6);
        assert_eq!(out[lfe][0], 0.0);
    }

    #[test]
    fn test_no_upmix_leaves_rear_silent() {
        let output = StdLayout::L4_0.layout();
        let m = RemapMatrix::build(&ChannelLayout::stereo(), &output, false, false, None);
        let l = [0.5f32];
        let mut out = vec![Vec::new(); 4];
        m.apply(&[&l, &l], 1, &mut out);
        assert_eq!(out[2][0], 0.0);
    }
}
