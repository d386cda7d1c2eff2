use crate::data::*;
use crate::dequant::Energies;
use crate::fbt::FrequencyTables;
use crate::hfgen::QmfRow;
use crate::syntax::{FrameGrid, SbrHeader};

use std::ops::Range;

/// Envelope adjuster state carried across frames of one channel.
#[derive(Debug, Clone)]
pub(crate) struct AdjusterState {
    g_temp: [[f32; QMF_BANDS]; SMOOTH_LENGTH],
    q_temp: [[f32; QMF_BANDS]; SMOOTH_LENGTH],
    /// Ring slot holding the newest gains.
    position: usize,
    noise_index: usize,
    sine_index: usize,
    /// The previous frame ended on a transient, so the first envelope of
    /// this frame is short.
    prev_env_is_short: bool,
    /// `bs_add_harmonic` of the previous frame, empty when none were coded.
    add_harmonic_prev: Vec<bool>,
    /// Fill the smoothing ring with the next gains instead of filtering.
    fresh: bool,
}

impl Default for AdjusterState {
    fn default() -> Self {
        AdjusterState {
            g_temp: [[0.0; QMF_BANDS]; SMOOTH_LENGTH],
            q_temp: [[0.0; QMF_BANDS]; SMOOTH_LENGTH],
            position: 0,
            noise_index: 0,
            sine_index: 0,
            prev_env_is_short: false,
            add_harmonic_prev: Vec::new(),
            fresh: true,
        }
    }
}

impl AdjusterState {
    /// Called when the frequency tables are rebuilt.
    pub(crate) fn reset(&mut self) {
        self.fresh = true;
        self.noise_index = 0;
        self.add_harmonic_prev.clear();
    }

    fn push(&mut self, gains: &EnvelopeGains) {
        let m = gains.gain.len();

        if self.fresh {
            for i in 0..SMOOTH_LENGTH {
                self.g_temp[i][..m].copy_from_slice(&gains.gain);
                self.q_temp[i][..m].copy_from_slice(&gains.noise);
            }
            self.fresh = false;
        } else {
            self.position = (self.position + 1) % SMOOTH_LENGTH;
            self.g_temp[self.position][..m].copy_from_slice(&gains.gain);
            self.q_temp[self.position][..m].copy_from_slice(&gains.noise);
        }
    }

    fn smoothed(&self, m: usize) -> (f32, f32) {
        let mut g = 0.0;
        let mut q = 0.0;

        for (i, &h) in SMOOTH_FILTER.iter().enumerate() {
            let slot = (self.position + SMOOTH_LENGTH - i) % SMOOTH_LENGTH;
            g += h * self.g_temp[slot][m];
            q += h * self.q_temp[slot][m];
        }

        (g, q)
    }

    fn newest(&self, m: usize) -> (f32, f32) {
        (self.g_temp[self.position][m], self.q_temp[self.position][m])
    }
}

/// Amplitudes applied to the subbands `[kx, kx + M)` of one envelope.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EnvelopeGains {
    pub gain: Vec<f32>,
    pub noise: Vec<f32>,
    pub sine: Vec<f32>,
}

/// Sinusoid placement per subband of the high band, for envelope `env`.
///
/// A sinusoid sits in the middle of its high resolution band. It starts at
/// the transient envelope unless it was already present in the previous
/// frame.
pub(crate) fn map_sinusoids(
    tables: &FrequencyTables,
    grid: &FrameGrid,
    add_harmonic: &[bool],
    add_harmonic_prev: &[bool],
    env: usize,
) -> Vec<bool> {
    let kx = tables.kx;
    let high = &tables.bands[1];
    let mut mapped = vec![false; tables.m];

    let after_transient = grid.transient_env.map_or(true, |l_a| env >= l_a);

    for (i, &flag) in add_harmonic.iter().enumerate() {
        if !flag {
            continue;
        }
        let carried = add_harmonic_prev.get(i).copied().unwrap_or(false);
        if after_transient || carried {
            let middle = (high[i] + high[i + 1]) / 2;
            mapped[middle - kx] = true;
        }
    }

    mapped
}

/// Energy of the generated high band per subband, averaged over the
/// envelope's slots, and over its scale factor band unless `interpol_freq`.
pub(crate) fn estimate_current_envelope(
    x: &[QmfRow],
    tables: &FrequencyTables,
    bands: &[usize],
    first_row: usize,
    last_row: usize,
    interpol_freq: bool,
) -> Vec<f32> {
    let kx = tables.kx;
    let slots = (last_row - first_row) as f32;

    let band_energy = |k: usize| -> f32 {
        x[first_row..last_row]
            .iter()
            .map(|row| row[k].norm_sqr())
            .sum::<f32>()
    };

    if interpol_freq {
        return (kx..kx + tables.m).map(|k| band_energy(k) / slots).collect();
    }

    let mut e_curr = vec![0.0; tables.m];
    for w in bands.windows(2) {
        let (k_l, k_h) = (w[0], w[1]);
        let sum: f32 = (k_l..k_h).map(band_energy).sum();
        let value = sum / (slots * (k_h - k_l) as f32);
        for e in e_curr[k_l - kx..k_h - kx].iter_mut() {
            *e = value;
        }
    }

    e_curr
}

/// Inputs of the gain calculation for one envelope, per high band subband.
pub(crate) struct GainInputs<'a> {
    pub e_orig: &'a [f32],
    pub e_curr: &'a [f32],
    pub noise: &'a [f32],
    pub sine_mapped: &'a [bool],
    /// A sinusoid is present somewhere in the subband's scale factor band.
    pub sine_in_band: &'a [bool],
    /// Noise is suppressed in this envelope.
    pub no_noise: bool,
}

/// Limited and boosted gains, noise and sinusoid levels of one envelope.
pub(crate) fn calculate_gains(
    tables: &FrequencyTables,
    header: &SbrHeader,
    inputs: &GainInputs,
) -> EnvelopeGains {
    let kx = tables.kx;
    let m_total = tables.m;
    let limiter = &tables.limiter[header.limiter_bands as usize];
    let limiter_gain = LIMITER_GAINS[header.limiter_gains as usize];

    let mut gains = EnvelopeGains {
        gain: vec![0.0; m_total],
        noise: vec![0.0; m_total],
        sine: vec![0.0; m_total],
    };

    let mut g_lim = vec![0.0; m_total];
    let mut q_lim = vec![0.0; m_total];
    let mut s_m = vec![0.0; m_total];

    for w in limiter.windows(2) {
        let range = w[0] - kx..w[1] - kx;

        let sum_orig: f32 = inputs.e_orig[range.clone()].iter().sum();
        let sum_curr: f32 = inputs.e_curr[range.clone()].iter().sum();
        let g_max = ((EPS + sum_orig) / (EPS + sum_curr) * limiter_gain).min(MAX_GAIN);

        let mut den = 0.0;
        for m in range.clone() {
            let e_orig = inputs.e_orig[m];
            let e_curr = inputs.e_curr[m];
            let q = inputs.noise[m];

            let q_m = e_orig * q / (1.0 + q);
            s_m[m] = if inputs.sine_mapped[m] {
                e_orig / (1.0 + q)
            } else {
                0.0
            };

            let g = if inputs.sine_in_band[m] {
                e_orig / (1.0 + e_curr) * q / (1.0 + q)
            } else if inputs.no_noise {
                e_orig / (1.0 + e_curr)
            } else {
                e_orig / ((1.0 + e_curr) * (1.0 + q))
            };

            if g > g_max {
                q_lim[m] = q_m * g_max / g;
                g_lim[m] = g_max;
            } else {
                q_lim[m] = q_m;
                g_lim[m] = g;
            }

            den += e_curr * g_lim[m];
            if inputs.sine_mapped[m] {
                den += s_m[m];
            } else if !inputs.no_noise {
                den += q_lim[m];
            }
        }

        let boost = ((sum_orig + EPS) / (den + EPS)).min(MAX_BOOST);

        for m in range {
            gains.gain[m] = (g_lim[m] * boost).sqrt();
            gains.noise[m] = (q_lim[m] * boost).sqrt();
            if inputs.sine_mapped[m] {
                gains.sine[m] = (s_m[m] * boost).sqrt();
            }
        }
    }

    gains
}

/// Applies the gains to `rows` and adds noise and sinusoids.
fn assemble(
    x: &mut [QmfRow],
    state: &mut AdjusterState,
    kx: usize,
    gains: &EnvelopeGains,
    rows: Range<usize>,
    smooth: bool,
    no_noise: bool,
) {
    for row in x[rows].iter_mut() {
        state.push(gains);

        for (m, &sine) in gains.sine.iter().enumerate() {
            let (g_filt, q_filt) = if smooth {
                state.smoothed(m)
            } else {
                state.newest(m)
            };
            let q_filt = if sine != 0.0 || no_noise { 0.0 } else { q_filt };

            state.noise_index = (state.noise_index + 1) & 511;
            let (noise_re, noise_im) = SBR_NOISE_TABLE[state.noise_index];

            let value = &mut row[m + kx];
            value.re = g_filt * value.re + q_filt * noise_re;
            value.im = g_filt * value.im + q_filt * noise_im;

            if sine != 0.0 {
                let rev = if (m + kx) & 1 == 1 { -1.0 } else { 1.0 };
                value.re += sine * PHI_RE[state.sine_index];
                value.im += rev * sine * PHI_IM[state.sine_index];
            }
        }

        state.sine_index = (state.sine_index + 1) & 3;
    }
}

/// Adjusts the generated high band of one channel frame to the transmitted
/// envelope and noise floor energies.
pub(crate) fn adjust(
    x: &mut [QmfRow],
    tables: &FrequencyTables,
    header: &SbrHeader,
    grid: &FrameGrid,
    energies: &Energies,
    add_harmonic: &[bool],
    state: &mut AdjusterState,
) {
    let kx = tables.kx;

    for env in 0..grid.num_env {
        let bands = &tables.bands[grid.freq_res[env] as usize];
        let first_row = RATE * grid.env_borders[env] + HF_ADJ;
        let last_row = RATE * grid.env_borders[env + 1] + HF_ADJ;

        let no_noise = grid.transient_env == Some(env) || (env == 0 && state.prev_env_is_short);

        let sine_mapped =
            map_sinusoids(tables, grid, add_harmonic, &state.add_harmonic_prev, env);

        let mut e_orig = vec![0.0; tables.m];
        let mut sine_in_band = vec![false; tables.m];
        for (band, w) in bands.windows(2).enumerate() {
            let range = w[0] - kx..w[1] - kx;
            let present = sine_mapped[range.clone()].iter().any(|&s| s);
            for m in range {
                e_orig[m] = energies.env[env][band];
                sine_in_band[m] = present;
            }
        }

        let noise_env = grid.noise_envelope_of(env);
        let noise: Vec<f32> = (kx..kx + tables.m)
            .map(|k| energies.noise[noise_env][tables.noise_band_of[k]])
            .collect();

        let e_curr = estimate_current_envelope(
            x,
            tables,
            bands,
            first_row,
            last_row,
            header.interpol_freq,
        );

        let gains = calculate_gains(
            tables,
            header,
            &GainInputs {
                e_orig: &e_orig,
                e_curr: &e_curr,
                noise: &noise,
                sine_mapped: &sine_mapped,
                sine_in_band: &sine_in_band,
                no_noise,
            },
        );

        let smooth = !header.smoothing_mode && !no_noise;
        assemble(x, state, kx, &gains, first_row..last_row, smooth, no_noise);
    }

    state.add_harmonic_prev = add_harmonic.to_vec();
    state.prev_env_is_short = grid.transient_env == Some(grid.num_env);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::tests::PayloadWriter;
    use crate::bits::PayloadReader;
    use crate::syntax::read_grid;

    use num::complex::Complex32;
    use num::Zero;

    fn header() -> SbrHeader {
        SbrHeader {
            start_freq: 5,
            stop_freq: 9,
            limiter_gains: 3,
            ..SbrHeader::default()
        }
    }

    fn tables(header: &SbrHeader) -> FrequencyTables {
        FrequencyTables::new(header, 44100, true).unwrap()
    }

    fn grid(bits: &[(u32, u32)]) -> FrameGrid {
        let mut w = PayloadWriter::new();
        for &(len, value) in bits {
            w.write(len, value);
        }
        let bytes = w.into_bytes();
        read_grid(&mut PayloadReader::new(&bytes), 16).unwrap()
    }

    fn fixfix_one_env() -> FrameGrid {
        grid(&[(2, 0), (2, 0), (1, 1)])
    }

    fn filled_rows(tables: &FrequencyTables) -> Vec<QmfRow> {
        let mut x = vec![[Complex32::zero(); QMF_BANDS]; 40];
        for (n, row) in x.iter_mut().enumerate() {
            for k in tables.kx..tables.kx + tables.m {
                row[k] = Complex32::new(
                    1.0 + ((n * 13 + k * 7) % 11) as f32,
                    ((n * 5 + k * 3) % 7) as f32 - 3.0,
                );
            }
        }
        x
    }

    #[test]
    fn boosted_energy_matches_transmitted_energy() {
        let header = header();
        let tables = tables(&header);
        let x = filled_rows(&tables);
        let bands = &tables.bands[1];

        let e_curr = estimate_current_envelope(&x, &tables, bands, 2, 34, true);
        let e_orig: Vec<f32> = (0..tables.m).map(|m| 1000.0 + 50.0 * m as f32).collect();
        // Index 30 noise floor.
        let noise = vec![(6.0f32 - 30.0).exp2(); tables.m];
        let none = vec![false; tables.m];

        let gains = calculate_gains(
            &tables,
            &header,
            &GainInputs {
                e_orig: &e_orig,
                e_curr: &e_curr,
                noise: &noise,
                sine_mapped: &none,
                sine_in_band: &none,
                no_noise: false,
            },
        );

        for lim in tables.limiter[header.limiter_bands as usize].windows(2) {
            let range = lim[0] - tables.kx..lim[1] - tables.kx;
            let target: f32 = e_orig[range.clone()].iter().sum();
            let total: f32 = range
                .map(|m| e_curr[m] * gains.gain[m].powi(2) + gains.noise[m].powi(2))
                .sum();
            assert!(
                (total - target).abs() <= target * 1e-4,
                "{} != {}",
                total,
                target
            );
        }
        assert!(gains.sine.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn limiter_caps_gain() {
        let header = SbrHeader {
            limiter_gains: 1,
            limiter_bands: 0,
            ..header()
        };
        let tables = tables(&header);

        // One loud subband in an otherwise quiet limiter band.
        let mut e_orig = vec![1.0; tables.m];
        e_orig[0] = 1e6;
        let e_curr = vec![100.0; tables.m];
        let noise = vec![0.0; tables.m];
        let none = vec![false; tables.m];

        let gains = calculate_gains(
            &tables,
            &header,
            &GainInputs {
                e_orig: &e_orig,
                e_curr: &e_curr,
                noise: &noise,
                sine_mapped: &none,
                sine_in_band: &none,
                no_noise: false,
            },
        );

        let sum_orig: f32 = e_orig.iter().sum();
        let g_max = sum_orig / (100.0 * tables.m as f32);
        let boost_ceiling = MAX_BOOST.sqrt();
        assert!(gains.gain[0] <= (g_max).sqrt() * boost_ceiling * 1.0001);
        assert!(gains.gain[0] < (1e6f32 / 101.0).sqrt());
    }

    #[test]
    fn sinusoid_replaces_noise() {
        let header = header();
        let tables = tables(&header);
        let grid = fixfix_one_env();

        let mut add_harmonic = vec![false; tables.num_bands(true)];
        add_harmonic[1] = true;
        let mapped = map_sinusoids(&tables, &grid, &add_harmonic, &[], 0);
        let middle = (tables.bands[1][1] + tables.bands[1][2]) / 2 - tables.kx;
        assert_eq!(mapped.iter().filter(|&&s| s).count(), 1);
        assert!(mapped[middle]);

        let n_high = tables.num_bands(true);
        let energies = Energies {
            env: vec![vec![4096.0; n_high]],
            noise: vec![vec![1.0; tables.num_noise_bands()]],
        };

        let mut x = filled_rows(&tables);
        let mut state = AdjusterState::default();
        adjust(&mut x, &tables, &header, &grid, &energies, &add_harmonic, &mut state);

        assert_eq!(state.add_harmonic_prev, add_harmonic);
        assert!(x.iter().all(|row| row.iter().all(|v| v.re.is_finite() && v.im.is_finite())));
    }

    #[test]
    fn transient_delays_new_sinusoids() {
        let header = header();
        let tables = tables(&header);
        // VARFIX, two envelopes, pointer 2 marks envelope 1.
        let grid = grid(&[(2, 2), (2, 0), (2, 1), (2, 1), (2, 2), (1, 1), (1, 1)]);
        assert_eq!(grid.transient_env, Some(1));

        let mut add_harmonic = vec![false; tables.num_bands(true)];
        add_harmonic[0] = true;

        let before = map_sinusoids(&tables, &grid, &add_harmonic, &[], 0);
        assert!(before.iter().all(|&s| !s));
        let after = map_sinusoids(&tables, &grid, &add_harmonic, &[], 1);
        assert!(after.iter().any(|&s| s));

        let carried = map_sinusoids(&tables, &grid, &add_harmonic, &add_harmonic, 0);
        assert_eq!(carried, after);
    }

    #[test]
    fn band_averaged_current_energy() {
        let header = header();
        let tables = tables(&header);
        let x = filled_rows(&tables);
        let bands = &tables.bands[0];

        let averaged = estimate_current_envelope(&x, &tables, bands, 2, 10, false);
        let per_subband = estimate_current_envelope(&x, &tables, bands, 2, 10, true);

        for w in bands.windows(2) {
            let range = w[0] - tables.kx..w[1] - tables.kx;
            let mean = per_subband[range.clone()].iter().sum::<f32>() / range.len() as f32;
            for m in range {
                assert!((averaged[m] - mean).abs() <= mean * 1e-5);
            }
        }
    }

    #[test]
    fn smoothing_ring_starts_filled() {
        let gains = EnvelopeGains {
            gain: vec![2.0; 4],
            noise: vec![0.5; 4],
            sine: vec![0.0; 4],
        };
        let mut state = AdjusterState::default();
        state.push(&gains);

        let (g, q) = state.smoothed(3);
        assert!((g - 2.0).abs() < 1e-5);
        assert!((q - 0.5).abs() < 1e-5);

        let louder = EnvelopeGains {
            gain: vec![4.0; 4],
            ..gains
        };
        state.push(&louder);
        let (g, _) = state.smoothed(0);
        assert!((g - (2.0 + 2.0 * SMOOTH_FILTER[0])).abs() < 1e-5);
        assert_eq!(state.newest(0).0, 4.0);
    }
}
