use crate::fbt::FrequencyTables;
use crate::syntax::{ChannelPayload, FrameGrid};

/// Envelope and noise floor indices carried from one frame to the next, used
/// as the reference of time-direction delta coding.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PreviousIndices {
    /// Last envelope of the previous frame.
    pub env: Vec<i32>,
    pub env_high_res: bool,
    /// Last noise floor of the previous frame.
    pub noise: Vec<i32>,
}

impl PreviousIndices {
    /// Drops history that no longer matches the band layout.
    pub(crate) fn fit(&mut self, tables: &FrequencyTables) {
        if self.env.len() != tables.num_bands(self.env_high_res) {
            self.env = vec![0; tables.num_bands(self.env_high_res)];
        }
        if self.noise.len() != tables.num_noise_bands() {
            self.noise = vec![0; tables.num_noise_bands()];
        }
    }
}

/// Delta decoded indices of one channel and frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ChannelIndices {
    pub env: Vec<Vec<i32>>,
    pub noise: Vec<Vec<i32>>,
}

impl ChannelIndices {
    /// History to keep once this frame is committed.
    pub(crate) fn to_previous(&self, grid: &FrameGrid) -> PreviousIndices {
        PreviousIndices {
            env: self.env.last().cloned().unwrap_or_default(),
            env_high_res: grid.freq_res[grid.num_env - 1],
            noise: self.noise.last().cloned().unwrap_or_default(),
        }
    }
}

/// Dequantized energies: `env[l][band]` at the envelope's own resolution and
/// `noise[q][band]` per noise band.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Energies {
    pub env: Vec<Vec<f32>>,
    pub noise: Vec<Vec<f32>>,
}

const PAN_OFFSET: [i32; 2] = [24, 12];

fn envelope_range(payload: &ChannelPayload) -> (i32, i32) {
    if payload.balance {
        (0, 2 * PAN_OFFSET[payload.amp_res as usize])
    } else {
        (0, 127 >> payload.amp_res as u32)
    }
}

fn noise_range(payload: &ChannelPayload) -> (i32, i32) {
    if payload.balance {
        (0, 24)
    } else {
        (0, 30)
    }
}

fn clip(value: i32, (min, max): (i32, i32)) -> i32 {
    value.max(min).min(max)
}

/// Accumulates the envelope deltas of one frame.
pub(crate) fn decode_envelope(
    tables: &FrequencyTables,
    grid: &FrameGrid,
    payload: &ChannelPayload,
    prev: &PreviousIndices,
) -> Vec<Vec<i32>> {
    let range = envelope_range(payload);
    let mut envelopes: Vec<Vec<i32>> = Vec::with_capacity(grid.num_env);

    for (env, deltas) in payload.env_deltas.iter().enumerate() {
        let high_res = grid.freq_res[env];
        let (reference, ref_high_res) = match envelopes.last() {
            Some(last) => (last.as_slice(), grid.freq_res[env - 1]),
            None => (prev.env.as_slice(), prev.env_high_res),
        };

        let mut values = Vec::with_capacity(deltas.len());
        if payload.env_time_diff[env] {
            for (band, &delta) in deltas.iter().enumerate() {
                let ref_band = match (high_res, ref_high_res) {
                    (true, false) => tables.high_to_low[band],
                    (false, true) => tables.low_to_high[band],
                    _ => band,
                };
                let previous = reference.get(ref_band).copied().unwrap_or(0);
                values.push(clip(previous + delta, range));
            }
        } else {
            let mut acc = 0;
            for &delta in deltas {
                acc = clip(acc + delta, range);
                values.push(acc);
            }
        }

        envelopes.push(values);
    }

    envelopes
}

/// Accumulates the noise floor deltas of one frame.
pub(crate) fn decode_noise(payload: &ChannelPayload, prev: &PreviousIndices) -> Vec<Vec<i32>> {
    let range = noise_range(payload);
    let mut floors: Vec<Vec<i32>> = Vec::with_capacity(payload.noise_deltas.len());

    for (noise, deltas) in payload.noise_deltas.iter().enumerate() {
        let reference = floors.last().map_or(prev.noise.as_slice(), |v| v.as_slice());

        let values = if payload.noise_time_diff[noise] {
            deltas
                .iter()
                .enumerate()
                .map(|(band, &delta)| {
                    clip(reference.get(band).copied().unwrap_or(0) + delta, range)
                })
                .collect()
        } else {
            let mut acc = 0;
            deltas
                .iter()
                .map(|&delta| {
                    acc = clip(acc + delta, range);
                    acc
                })
                .collect()
        };

        floors.push(values);
    }

    floors
}

pub(crate) fn decode_indices(
    tables: &FrequencyTables,
    grid: &FrameGrid,
    payload: &ChannelPayload,
    prev: &PreviousIndices,
) -> ChannelIndices {
    ChannelIndices {
        env: decode_envelope(tables, grid, payload, prev),
        noise: decode_noise(payload, prev),
    }
}

/// Envelope steps per doubling of energy.
fn steps_per_octave(amp_res: bool) -> f32 {
    if amp_res {
        1.0
    } else {
        2.0
    }
}

/// Independent channel: `E = 2^(E_q / a + 6)`, `Q = 2^(6 - Q_q)`.
pub(crate) fn dequantize(indices: &ChannelIndices, amp_res: bool) -> Energies {
    let a = steps_per_octave(amp_res);

    Energies {
        env: indices
            .env
            .iter()
            .map(|env| env.iter().map(|&e| (e as f32 / a + 6.0).exp2()).collect())
            .collect(),
        noise: indices
            .noise
            .iter()
            .map(|noise| noise.iter().map(|&q| (6.0 - q as f32).exp2()).collect())
            .collect(),
    }
}

/// Coupled pair: the first channel carries the level, the second the pan
/// position. Returns the energies of the left and right channel.
pub(crate) fn dequantize_coupled(
    sum: &ChannelIndices,
    balance: &ChannelIndices,
    amp_res: bool,
) -> [Energies; 2] {
    let a = steps_per_octave(amp_res);
    let pan_offset = PAN_OFFSET[amp_res as usize] as f32;

    let mut left = Energies::default();
    let mut right = Energies::default();

    for (level, pan) in sum.env.iter().zip(balance.env.iter()) {
        let (l, r): (Vec<f32>, Vec<f32>) = level
            .iter()
            .zip(pan.iter())
            .map(|(&e0, &e1)| {
                let t1 = (e0 as f32 / a + 7.0).exp2();
                let t2 = ((pan_offset - e1 as f32) / a).exp2();
                let l = t1 / (1.0 + t2);
                (l, l * t2)
            })
            .unzip();
        left.env.push(l);
        right.env.push(r);
    }

    for (level, pan) in sum.noise.iter().zip(balance.noise.iter()) {
        let (l, r): (Vec<f32>, Vec<f32>) = level
            .iter()
            .zip(pan.iter())
            .map(|(&q0, &q1)| {
                let t1 = (7.0 - q0 as f32).exp2();
                let t2 = (12.0 - q1 as f32).exp2();
                let l = t1 / (1.0 + t2);
                (l, l * t2)
            })
            .unzip();
        left.noise.push(l);
        right.noise.push(r);
    }

    [left, right]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::PayloadReader;
    use crate::syntax::{read_grid, SbrHeader};

    fn tables() -> FrequencyTables {
        let header = SbrHeader {
            start_freq: 5,
            stop_freq: 9,
            ..SbrHeader::default()
        };
        FrequencyTables::new(&header, 44100, true).unwrap()
    }

    fn fixfix(num_env_bits: u32, high_res: bool) -> FrameGrid {
        let mut w = crate::bits::tests::PayloadWriter::new();
        w.write(2, 0).write(2, num_env_bits).bit(high_res);
        let bytes = w.into_bytes();
        read_grid(&mut PayloadReader::new(&bytes), 16).unwrap()
    }

    /// Encodes absolute indices the way an encoder would, picking the
    /// direction per envelope.
    fn encode(values: &[Vec<i32>], time_diff: &[bool], prev: &[i32]) -> Vec<Vec<i32>> {
        let mut reference = prev.to_vec();
        values
            .iter()
            .zip(time_diff.iter())
            .map(|(env, &dt)| {
                let deltas = if dt {
                    env.iter().zip(reference.iter()).map(|(v, r)| v - r).collect()
                } else {
                    let mut last = 0;
                    env.iter()
                        .map(|&v| {
                            let d = v - last;
                            last = v;
                            d
                        })
                        .collect()
                };
                reference = env.clone();
                deltas
            })
            .collect()
    }

    #[test]
    fn envelope_deltas_in_both_directions() {
        let tables = tables();
        let grid = fixfix(1, true);
        let n = tables.num_bands(true);

        let values: Vec<Vec<i32>> = vec![
            (0..n as i32).map(|b| 40 + b).collect(),
            (0..n as i32).map(|b| 50 - b).collect(),
        ];
        let prev = PreviousIndices {
            env: vec![30; n],
            env_high_res: true,
            noise: vec![],
        };

        for &dt in &[[false, false], [true, false], [false, true], [true, true]] {
            let mut payload = ChannelPayload::default();
            payload.env_time_diff[..2].copy_from_slice(&dt);
            payload.env_deltas = encode(&values, &dt, &prev.env);

            assert_eq!(decode_envelope(&tables, &grid, &payload, &prev), values);
        }
    }

    #[test]
    fn envelope_time_deltas_across_resolutions() {
        let tables = tables();
        let n_low = tables.num_bands(false);
        let n_high = tables.num_bands(true);

        let prev_low = PreviousIndices {
            env: (0..n_low as i32).map(|b| 10 * b).collect(),
            env_high_res: false,
            noise: vec![],
        };
        let mut payload = ChannelPayload::default();
        payload.env_time_diff[0] = true;
        payload.env_deltas = vec![vec![1; n_high]];

        let grid = fixfix(0, true);
        let decoded = decode_envelope(&tables, &grid, &payload, &prev_low);
        for (band, &value) in decoded[0].iter().enumerate() {
            assert_eq!(value, prev_low.env[tables.high_to_low[band]] + 1);
        }

        let prev_high = PreviousIndices {
            env: (0..n_high as i32).collect(),
            env_high_res: true,
            noise: vec![],
        };
        payload.env_deltas = vec![vec![0; n_low]];
        let grid = fixfix(0, false);
        let decoded = decode_envelope(&tables, &grid, &payload, &prev_high);
        for (band, &value) in decoded[0].iter().enumerate() {
            assert_eq!(value, tables.low_to_high[band] as i32);
        }
    }

    #[test]
    fn indices_are_clipped() {
        let tables = tables();
        let grid = fixfix(0, false);
        let n = tables.num_bands(false);

        let mut payload = ChannelPayload::default();
        payload.amp_res = true;
        payload.env_deltas = vec![vec![70; n]];
        payload.noise_deltas = vec![vec![-3; tables.num_noise_bands()]];

        let prev = PreviousIndices::default();
        let indices = decode_indices(&tables, &grid, &payload, &prev);
        assert!(indices.env[0].iter().all(|&e| e == 63));
        assert!(indices.noise[0].iter().all(|&q| q == 0));
    }

    #[test]
    fn noise_time_deltas() {
        let mut payload = ChannelPayload::default();
        payload.noise_time_diff = [true, false];
        payload.noise_deltas = vec![vec![1, -2], vec![4, 3]];
        let prev = PreviousIndices {
            env: vec![],
            env_high_res: false,
            noise: vec![10, 20],
        };

        assert_eq!(
            decode_noise(&payload, &prev),
            vec![vec![11, 18], vec![4, 7]]
        );
    }

    #[test]
    fn dequantization() {
        let indices = ChannelIndices {
            env: vec![vec![0, 2, 12]],
            noise: vec![vec![6, 0]],
        };

        let fine = dequantize(&indices, false);
        assert_close(&fine.env[0], &[64.0, 128.0, 4096.0]);
        assert_close(&fine.noise[0], &[1.0, 64.0]);

        let coarse = dequantize(&indices, true);
        assert_close(&coarse.env[0], &[64.0, 256.0, 262144.0]);
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() <= e * 1e-6, "{} != {}", a, e);
        }
    }

    #[test]
    fn centred_pan_splits_energy_evenly() {
        let sum = ChannelIndices {
            env: vec![vec![20, 0]],
            noise: vec![vec![3]],
        };
        let balance = ChannelIndices {
            env: vec![vec![24, 48]],
            noise: vec![vec![12]],
        };

        let [left, right] = dequantize_coupled(&sum, &balance, false);
        assert!((left.env[0][0] - right.env[0][0]).abs() < 1e-2);
        assert!((left.env[0][0] - 2f32.powf(16.0)).abs() < 1e-2);
        assert!((left.noise[0][0] - right.noise[0][0]).abs() < 1e-6);
        assert!((left.noise[0][0] - 8.0).abs() < 1e-6);

        // Fully panned to the left.
        assert!(left.env[0][1] > 1000.0 * right.env[0][1]);
        let total = left.env[0][1] + right.env[0][1];
        assert!((total - 128.0).abs() < 1e-3);
    }
}
