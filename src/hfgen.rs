use crate::data::*;
use crate::fbt::FrequencyTables;

use num::complex::Complex32;
use num::Zero;

/// One QMF slot of all 64 bands.
pub(crate) type QmfRow = [Complex32; QMF_BANDS];

/// Target bandwidth of an inverse filtering mode, given the previous mode.
fn map_new_bw(invf_mode: u8, prev_invf_mode: u8) -> f32 {
    match invf_mode {
        1 => {
            if prev_invf_mode == 0 {
                0.6
            } else {
                0.75
            }
        }
        2 => 0.9,
        3 => 0.98,
        _ => {
            if prev_invf_mode == 1 {
                0.6
            } else {
                0.0
            }
        }
    }
}

/// Chirp factors per noise band, smoothed against the previous frame.
pub(crate) fn chirp_factors(
    num_noise_bands: usize,
    invf_mode: &[u8; MAX_NOISE_BANDS],
    prev_invf_mode: &[u8; MAX_NOISE_BANDS],
    bw_prev: &[f32; MAX_NOISE_BANDS],
) -> [f32; MAX_NOISE_BANDS] {
    let mut bw = [0.0; MAX_NOISE_BANDS];

    for i in 0..num_noise_bands {
        let new_bw = map_new_bw(invf_mode[i], prev_invf_mode[i]);

        let tmp = if new_bw < bw_prev[i] {
            0.75 * new_bw + 0.25 * bw_prev[i]
        } else {
            0.90625 * new_bw + 0.09375 * bw_prev[i]
        };

        bw[i] = if tmp < 0.015625 {
            0.0
        } else {
            tmp.min(0.99609375)
        };
    }

    bw
}

/// Second order complex predictor of one low band, `alpha[0]` and `alpha[1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Predictor {
    pub alpha: [Complex32; 2],
}

impl Predictor {
    const ZERO: Predictor = Predictor {
        alpha: [Complex32 { re: 0.0, im: 0.0 }; 2],
    };
}

/// Covariance method LPC over rows `[HF_ADJ, HF_ADJ + len)` of subband `band`.
pub(crate) fn prediction_coefficients(x: &[QmfRow], band: usize, len: usize) -> Predictor {
    let rel = 1.0 / (1.0 + 1e-6);

    let mut r01 = Complex32::zero();
    let mut r02 = Complex32::zero();
    let mut r11 = 0.0;
    let mut r12 = Complex32::zero();
    let mut r22 = 0.0;

    for n in HF_ADJ..HF_ADJ + len {
        let x0 = x[n][band];
        let x1 = x[n - 1][band];
        let x2 = x[n - 2][band];

        r01 += x0 * x1.conj();
        r02 += x0 * x2.conj();
        r11 += x1.norm_sqr();
        r12 += x1 * x2.conj();
        r22 += x2.norm_sqr();
    }

    let det = r11 * r22 - rel * r12.norm_sqr();

    let alpha_1 = if det == 0.0 {
        Complex32::zero()
    } else {
        (r01 * r12 - r02 * r11) / det
    };

    let alpha_0 = if r11 == 0.0 {
        Complex32::zero()
    } else {
        -(r01 + alpha_1 * r12.conj()) / r11
    };

    if alpha_0.norm_sqr() >= 16.0 || alpha_1.norm_sqr() >= 16.0 {
        return Predictor::ZERO;
    }

    Predictor {
        alpha: [alpha_0, alpha_1],
    }
}

/// Fills the high bands of rows `[first, last)` (offset by `HF_ADJ`) from the
/// patched low bands, filtered by the chirp factor of each target noise band.
pub(crate) fn generate_high_band(
    x: &mut [QmfRow],
    tables: &FrequencyTables,
    bw: &[f32; MAX_NOISE_BANDS],
    first: usize,
    last: usize,
    lpc_len: usize,
) {
    for patch in &tables.patches {
        for i in 0..patch.len {
            let k = patch.target + i;
            let p = patch.source + i;

            let g = tables.noise_band_of[k];
            let bw = bw[g];
            let bw2 = bw * bw;

            let filter = if bw2 > 0.0 {
                let predictor = prediction_coefficients(x, p, lpc_len);
                Some([predictor.alpha[0] * bw, predictor.alpha[1] * bw2])
            } else {
                None
            };

            for l in first..last {
                let row = l + HF_ADJ;
                let mut value = x[row][p];
                if let Some(alpha) = filter {
                    value += alpha[0] * x[row - 1][p] + alpha[1] * x[row - 2][p];
                }
                x[row][k] = value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::SbrHeader;

    fn rows(len: usize) -> Vec<QmfRow> {
        vec![[Complex32::zero(); QMF_BANDS]; len]
    }

    fn tables() -> FrequencyTables {
        let header = SbrHeader {
            start_freq: 5,
            stop_freq: 9,
            ..SbrHeader::default()
        };
        FrequencyTables::new(&header, 44100, true).unwrap()
    }

    #[test]
    fn chirp_smoothing() {
        let prev = [0.0; MAX_NOISE_BANDS];
        let bw = chirp_factors(4, &[0, 1, 2, 3, 3], &[0; 5], &prev);
        assert_eq!(bw[0], 0.0);
        assert!((bw[1] - 0.90625 * 0.6).abs() < 1e-6);
        assert!((bw[2] - 0.90625 * 0.9).abs() < 1e-6);
        assert!((bw[3] - 0.90625 * 0.98).abs() < 1e-6);
        assert_eq!(bw[4], 0.0);

        // Release towards a smaller bandwidth is slower.
        let bw = chirp_factors(1, &[0; 5], &[2; 5], &[0.9; 5]);
        assert!((bw[0] - 0.25 * 0.9).abs() < 1e-6);

        // Capped just below one.
        let bw = chirp_factors(1, &[3; 5], &[3; 5], &[0.99609375; 5]);
        assert_eq!(bw[0], 0.99609375);
    }

    #[test]
    fn predictor_of_damped_oscillator() {
        // x[n] = r * e^(j w) * x[n - 1], so alpha_0 = -r e^(j w), alpha_1 = 0.
        let pole = Complex32::from_polar(&0.9, &0.7);
        let mut x = rows(40);
        let mut value = Complex32::new(1.0, 0.0);
        for row in x.iter_mut() {
            row[3] = value;
            value *= pole;
        }

        let predictor = prediction_coefficients(&x, 3, 38);
        assert!((predictor.alpha[0] + pole).norm() < 1e-3);
        assert!(predictor.alpha[1].norm() < 1e-3);
    }

    #[test]
    fn silent_band_has_no_predictor() {
        let x = rows(40);
        assert_eq!(prediction_coefficients(&x, 5, 38), Predictor::ZERO);
    }

    #[test]
    fn zero_bandwidth_patch_is_a_copy() {
        let tables = tables();
        let mut x = rows(40);
        for (n, row) in x.iter_mut().enumerate() {
            for (k, value) in row.iter_mut().enumerate().take(tables.kx) {
                *value = Complex32::new((n * 7 + k) as f32 % 5.0 - 2.0, (n + 3 * k) as f32 % 3.0);
            }
        }
        let source = x.clone();

        generate_high_band(&mut x, &tables, &[0.0; MAX_NOISE_BANDS], 0, 32, 38);

        for patch in &tables.patches {
            for i in 0..patch.len {
                for row in HF_ADJ..HF_ADJ + 32 {
                    assert_eq!(x[row][patch.target + i], source[row][patch.source + i]);
                }
            }
        }
        for row in x.iter().skip(HF_ADJ + 32) {
            assert!(row[tables.kx..].iter().all(|v| v.is_zero()));
        }
    }

    #[test]
    fn filtered_patch_adds_prediction() {
        let tables = tables();
        let patch = tables.patches[0];
        let mut x = rows(40);
        let pole = Complex32::from_polar(&0.8, &1.1);
        let mut value = Complex32::new(1.0, 0.5);
        for row in x.iter_mut() {
            row[patch.source] = value;
            value *= pole;
        }
        let source = x.clone();

        generate_high_band(&mut x, &tables, &[0.5; MAX_NOISE_BANDS], 4, 8, 38);

        let predictor = prediction_coefficients(&source, patch.source, 38);
        let row = 4 + HF_ADJ;
        let expected = source[row][patch.source]
            + predictor.alpha[0] * 0.5 * source[row - 1][patch.source]
            + predictor.alpha[1] * 0.25 * source[row - 2][patch.source];
        assert!((x[row][patch.target] - expected).norm() < 1e-5);
        // Rows outside the range stay untouched.
        assert!(x[HF_ADJ + 3][patch.target].is_zero());
    }
}
