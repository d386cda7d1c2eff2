use crate::data::*;
use crate::syntax::SbrHeader;
use crate::Error;

use log::{debug, warn};

/// Maps a sample rate onto one of the 12 MPEG-4 sampling frequency indices,
/// picking the nearest nominal rate.
pub(crate) fn sample_rate_index(sample_rate: u32) -> usize {
    SAMPLE_RATE_THRESHOLDS
        .iter()
        .position(|&threshold| sample_rate >= threshold)
        .unwrap_or(SAMPLE_RATE_THRESHOLDS.len())
}

/// First QMF channel of the SBR range, `k0`.
pub(crate) fn qmf_start_channel(start_freq: u8, rate_mode: bool, sr_index: usize) -> usize {
    let row = if rate_mode {
        START_OFFSET_ROW[sr_index]
    } else {
        6
    };

    let k0 = START_MIN[sr_index] as i32 + START_OFFSETS[row][start_freq as usize & 0xF] as i32;

    k0.max(0) as usize
}

/// Last QMF channel (exclusive) of the SBR range, `k2`.
pub(crate) fn qmf_stop_channel(stop_freq: u8, sr_index: usize, k0: usize) -> usize {
    let k2 = match stop_freq {
        15 => 3 * k0 as i32,
        14 => 2 * k0 as i32,
        _ => {
            STOP_MIN[sr_index] as i32 + STOP_OFFSETS[sr_index][(stop_freq as usize).min(13)] as i32
        }
    };

    k2.max(0).min(QMF_BANDS as i32) as usize
}

/// Largest legal `k2 - k0` span for a sampling frequency index.
fn max_sbr_span(sr_index: usize) -> usize {
    match SAMPLE_RATES[sr_index] {
        rate if rate <= 32000 => 48,
        rate if rate == 44100 => 35,
        _ => 32,
    }
}

fn round_ties_up(value: f64) -> i32 {
    (value + 0.5).floor() as i32
}

/// Band widths of a geometric split of `[start, stop)` into `num_bands`,
/// sorted ascending.
fn geometric_widths(start: usize, stop: usize, num_bands: usize) -> Vec<i32> {
    let q = (stop as f64 / start as f64).powf(1.0 / num_bands as f64);

    let mut widths = Vec::with_capacity(num_bands);
    let mut qk = start as f64;
    let mut border = round_ties_up(qk);
    for _ in 0..num_bands {
        let prev = border;
        qk *= q;
        border = round_ties_up(qk);
        widths.push(border - prev);
    }

    widths.sort_unstable();
    widths
}

fn num_log_bands(bands_per_octave: u32, start: usize, stop: usize, warp: f64) -> usize {
    let octaves = (stop as f64 / start as f64).log2();
    let half = round_ties_up(bands_per_octave as f64 * octaves / (2.0 * warp));

    (2 * half.max(0) as usize).min(63)
}

fn accumulate(start: usize, widths: &[i32], table: &mut Vec<usize>) -> Result<(), Error> {
    let mut border = start as i32;
    for &width in widths {
        if width <= 0 {
            return Err(Error::InvalidTables(format!(
                "master band of width {} starting at {}",
                width, border
            )));
        }
        border += width;
        table.push(border as usize);
    }

    Ok(())
}

/// Master frequency band table, `N_master + 1` borders from `k0` to `k2`.
pub(crate) fn master_frequency_table(
    k0: usize,
    k2: usize,
    freq_scale: u8,
    alter_scale: bool,
) -> Result<Vec<usize>, Error> {
    if k2 <= k0 || k0 == 0 {
        return Err(Error::InvalidTables(format!(
            "stop channel {} not above start channel {}",
            k2, k0
        )));
    }

    let mut table = vec![k0];

    if freq_scale == 0 {
        let (width, num_bands) = if alter_scale {
            (2, ((k2 - k0 + 2) >> 2) << 1)
        } else {
            (1, ((k2 - k0) >> 1) << 1)
        };
        let num_bands = num_bands.min(63);
        if num_bands == 0 {
            return Err(Error::InvalidTables("linear master table has no bands".into()));
        }

        let mut widths = vec![width as i32; num_bands];
        let mut diff = k2 as i32 - (k0 + num_bands * width) as i32;

        // Spread the rounding remainder from the top down, or grow from the bottom up.
        let mut k = if diff > 0 { num_bands - 1 } else { 0 };
        while diff != 0 {
            let slot = widths.get_mut(k).ok_or_else(|| {
                Error::InvalidTables("linear master table remainder out of range".into())
            })?;
            if diff > 0 {
                *slot += 1;
                diff -= 1;
                k = k.wrapping_sub(1);
            } else {
                *slot -= 1;
                diff += 1;
                k += 1;
            }
        }

        accumulate(k0, &widths, &mut table)?;
    } else {
        let bands = BANDS_PER_OCTAVE[(freq_scale as usize - 1).min(2)];
        let two_regions = k2 as f64 / k0 as f64 > 2.2449;
        let k1 = if two_regions { 2 * k0 } else { k2 };

        let num_bands0 = num_log_bands(bands, k0, k1, 1.0);
        if num_bands0 == 0 {
            return Err(Error::InvalidTables("first master region has no bands".into()));
        }
        let widths0 = geometric_widths(k0, k1, num_bands0);
        accumulate(k0, &widths0, &mut table)?;

        if two_regions {
            let warp = if alter_scale { 1.3 } else { 1.0 };
            let num_bands1 = num_log_bands(bands, k1, k2, warp);
            if num_bands1 == 0 {
                return Err(Error::InvalidTables("second master region has no bands".into()));
            }
            let mut widths1 = geometric_widths(k1, k2, num_bands1);

            let widest0 = widths0[num_bands0 - 1];
            if widths1[0] < widest0 {
                let change = (widest0 - widths1[0]).min((widths1[num_bands1 - 1] - widths1[0]) / 2);
                widths1[0] += change;
                widths1[num_bands1 - 1] -= change;
                widths1.sort_unstable();
            }

            accumulate(k1, &widths1, &mut table)?;
        }
    }

    Ok(table)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Patch {
    /// First source subband.
    pub source: usize,
    /// First target subband.
    pub target: usize,
    pub len: usize,
}

/// Plans the low-to-high copy-up patches covering `[kx, kx + m)`.
pub(crate) fn patch_construction(
    master: &[usize],
    k0: usize,
    kx: usize,
    m: usize,
    sample_rate: u32,
) -> Result<Vec<Patch>, Error> {
    let n_master = master.len() - 1;
    let goal_sb = (2.048e6 / sample_rate as f64 + 0.5) as usize;

    let mut k = if goal_sb < kx + m {
        master.iter().position(|&band| band >= goal_sb).unwrap_or(n_master)
    } else {
        n_master
    };

    let mut patches: Vec<Patch> = Vec::new();
    let mut msb = k0;
    let mut usb = kx;
    let mut target = kx;

    for _ in 0..QMF_BANDS {
        let mut j = k + 1;
        let (sb, odd) = loop {
            j = j.checked_sub(1).ok_or_else(|| {
                Error::InvalidTables("no master band fits the next patch".into())
            })?;
            let sb = master[j];
            let odd = (sb + k0 - 2) % 2;
            if sb <= k0 - 1 + msb - odd {
                break (sb, odd);
            }
        };

        let len = sb.saturating_sub(usb);
        if len > 0 {
            let source = (k0 - odd).checked_sub(len).ok_or_else(|| {
                Error::InvalidTables(format!("patch of {} bands below channel 0", len))
            })?;
            patches.push(Patch {
                source,
                target,
                len,
            });
            target += len;
            usb = sb;
            msb = sb;
        } else {
            msb = kx;
        }

        if master[k] < sb + 3 {
            k = n_master;
        }

        if sb == kx + m {
            if patches.len() > 1 && patches[patches.len() - 1].len < 3 {
                patches.pop();
            }
            if patches.len() > MAX_PATCHES {
                warn!("{} patches planned, keeping the first {}", patches.len(), MAX_PATCHES);
                patches.truncate(MAX_PATCHES);
            }
            if patches.is_empty() {
                return Err(Error::InvalidTables("no patches planned".into()));
            }
            return Ok(patches);
        }
    }

    Err(Error::InvalidTables("patch planning did not converge".into()))
}

/// Limiter band borders for `bs_limiter_bands` 1..=3. Table 0 is one band.
fn limiter_frequency_tables(low: &[usize], patches: &[Patch]) -> [Vec<usize>; 4] {
    let n_low = low.len() - 1;
    let mut tables = [
        vec![low[0], low[n_low]],
        Vec::new(),
        Vec::new(),
        Vec::new(),
    ];

    let mut patch_borders = Vec::with_capacity(patches.len() + 1);
    patch_borders.push(patches[0].target);
    for patch in patches {
        patch_borders.push(patch.target + patch.len);
    }

    for (s, &bands_per_octave) in LIMITER_BANDS_PER_OCTAVE.iter().enumerate() {
        let mut lim: Vec<usize> = low.to_vec();
        lim.extend_from_slice(&patch_borders[1..patches.len()]);
        lim.sort_unstable();

        let threshold = 2f32.powf(0.49 / bands_per_octave);

        let mut k = 1;
        while k < lim.len() {
            let ratio = if lim[k - 1] != 0 {
                lim[k] as f32 / lim[k - 1] as f32
            } else {
                0.0
            };

            if ratio >= threshold {
                k += 1;
                continue;
            }

            if lim[k] != lim[k - 1] && patch_borders.contains(&lim[k]) {
                if patch_borders.contains(&lim[k - 1]) {
                    k += 1;
                } else {
                    lim.remove(k - 1);
                }
                continue;
            }

            lim.remove(k);
        }

        tables[s + 1] = lim;
    }

    tables
}

/// Band tables derived from an SBR header, rebuilt on every reset.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyTables {
    pub(crate) k0: usize,
    pub(crate) k2: usize,
    pub(crate) kx: usize,
    pub(crate) m: usize,
    pub(crate) master: Vec<usize>,
    /// Envelope band borders, indexed by frequency resolution (0 low, 1 high).
    pub(crate) bands: [Vec<usize>; 2],
    pub(crate) noise: Vec<usize>,
    pub(crate) limiter: [Vec<usize>; 4],
    pub(crate) patches: Vec<Patch>,
    /// Index of the low resolution band containing each high resolution band.
    pub(crate) high_to_low: Vec<usize>,
    /// Index of the high resolution band starting at each low resolution band.
    pub(crate) low_to_high: Vec<usize>,
    /// Noise band of each absolute QMF subband in `[kx, kx + m)`.
    pub(crate) noise_band_of: [usize; QMF_BANDS],
}

impl FrequencyTables {
    pub(crate) fn new(
        header: &SbrHeader,
        sample_rate: u32,
        rate_mode: bool,
    ) -> Result<FrequencyTables, Error> {
        let sr_index = sample_rate_index(sample_rate);

        let k0 = qmf_start_channel(header.start_freq, rate_mode, sr_index);
        let k2 = qmf_stop_channel(header.stop_freq, sr_index, k0);

        if k2 <= k0 {
            return Err(Error::InvalidTables(format!(
                "stop channel {} not above start channel {}",
                k2, k0
            )));
        }
        if k2 - k0 > max_sbr_span(sr_index) {
            return Err(Error::InvalidTables(format!(
                "SBR range {}..{} too wide for {} Hz",
                k0, k2, SAMPLE_RATES[sr_index]
            )));
        }

        let master = master_frequency_table(k0, k2, header.freq_scale, header.alter_scale)?;
        let n_master = master.len() - 1;

        let xover = header.xover_band as usize;
        if xover >= n_master {
            return Err(Error::InvalidTables(format!(
                "crossover band {} beyond {} master bands",
                xover, n_master
            )));
        }

        let high: Vec<usize> = master[xover..].to_vec();
        let n_high = high.len() - 1;
        let n_low = (n_high + 1) / 2;
        let odd = n_high & 1;
        let low: Vec<usize> = (0..=n_low)
            .map(|k| if k == 0 { high[0] } else { high[2 * k - odd] })
            .collect();

        let kx = high[0];
        let m = high[n_high] - kx;
        if kx > 32 {
            return Err(Error::InvalidTables(format!("kx {} above 32", kx)));
        }
        if kx + m > QMF_BANDS {
            return Err(Error::InvalidTables(format!(
                "kx {} + M {} exceeds {} channels",
                kx, m, QMF_BANDS
            )));
        }

        let n_q = if header.noise_bands == 0 {
            1
        } else {
            let bands = header.noise_bands as f64 * (k2 as f64 / kx as f64).log2();
            (round_ties_up(bands).max(1) as usize).min(MAX_NOISE_BANDS)
        }
        .min(n_low);

        let mut noise = Vec::with_capacity(n_q + 1);
        noise.push(low[0]);
        let mut i = 0;
        for k in 1..=n_q {
            i += (n_low - i) / (n_q + 1 - k);
            noise.push(low[i]);
        }

        let patches = patch_construction(&master, k0, kx, m, SAMPLE_RATES[sr_index])?;
        let limiter = limiter_frequency_tables(&low, &patches);

        let high_to_low = high[..n_high]
            .iter()
            .map(|&band| {
                low.windows(2)
                    .position(|w| w[0] <= band && band < w[1])
                    .unwrap_or(n_low - 1)
            })
            .collect();
        let low_to_high = low[..n_low]
            .iter()
            .map(|&band| high.iter().position(|&h| h == band).unwrap_or(0))
            .collect();

        let mut noise_band_of = [0; QMF_BANDS];
        for (band, w) in noise.windows(2).enumerate() {
            for slot in noise_band_of[w[0]..w[1]].iter_mut() {
                *slot = band;
            }
        }

        debug!(
            "frequency tables rebuilt: k0 {} k2 {} kx {} M {} bands {}/{} noise bands {} patches {}",
            k0,
            k2,
            kx,
            m,
            n_low,
            n_high,
            n_q,
            patches.len()
        );

        Ok(FrequencyTables {
            k0,
            k2,
            kx,
            m,
            master,
            bands: [low, high],
            noise,
            limiter,
            patches,
            high_to_low,
            low_to_high,
            noise_band_of,
        })
    }

    /// Number of envelope bands at a frequency resolution.
    pub(crate) fn num_bands(&self, high_res: bool) -> usize {
        self.bands[high_res as usize].len() - 1
    }

    pub(crate) fn num_noise_bands(&self) -> usize {
        self.noise.len() - 1
    }

    pub fn start_channel(&self) -> usize {
        self.kx
    }

    /// `k0..k2`, the QMF channels spanned by the master table.
    pub fn master_range(&self) -> (usize, usize) {
        (self.k0, self.k2)
    }

    pub fn master(&self) -> &[usize] {
        &self.master
    }

    pub fn num_sbr_channels(&self) -> usize {
        self.m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(start_freq: u8, stop_freq: u8, freq_scale: u8) -> SbrHeader {
        SbrHeader {
            start_freq,
            stop_freq,
            freq_scale,
            ..SbrHeader::default()
        }
    }

    fn strictly_increasing(table: &[usize]) -> bool {
        table.windows(2).all(|w| w[0] < w[1])
    }

    #[test]
    fn sample_rate_indices() {
        assert_eq!(sample_rate_index(96000), 0);
        assert_eq!(sample_rate_index(48000), 3);
        assert_eq!(sample_rate_index(44100), 4);
        assert_eq!(sample_rate_index(24000), 6);
        assert_eq!(sample_rate_index(8000), 11);
        assert_eq!(sample_rate_index(45000), 4);
    }

    #[test]
    fn start_and_stop_channels() {
        let sr = sample_rate_index(44100);
        let k0 = qmf_start_channel(5, true, sr);
        assert_eq!(k0, 12 + 2);
        assert_eq!(qmf_stop_channel(9, sr, k0), 23 + 24);
        assert_eq!(qmf_stop_channel(14, sr, k0), 28);
        assert_eq!(qmf_stop_channel(15, sr, k0), 42);
        assert_eq!(qmf_stop_channel(15, sr, 30), 64);
    }

    #[test]
    fn master_table_scenario() {
        let sr = sample_rate_index(44100);
        let k0 = qmf_start_channel(5, true, sr);
        let k2 = qmf_stop_channel(15, sr, k0);

        let table = master_frequency_table(k0, k2, 2, true).unwrap();
        assert!(table.len() > 1);
        assert_eq!(table[0], k0);
        assert_eq!(*table.last().unwrap(), k2);
        assert!(strictly_increasing(&table));

        let again = master_frequency_table(k0, k2, 2, true).unwrap();
        assert_eq!(table, again);
    }

    #[test]
    fn master_tables_monotonic() {
        for k0 in 4..32 {
            for k2 in (k0 + 1)..=64 {
                for freq_scale in 0..4 {
                    for &alter_scale in &[false, true] {
                        if let Ok(table) = master_frequency_table(k0, k2, freq_scale, alter_scale) {
                            assert!(strictly_increasing(&table), "{} {} {}", k0, k2, freq_scale);
                            assert_eq!(table[0], k0);
                            assert_eq!(*table.last().unwrap(), k2);
                            assert!(table.len() - 1 <= 63);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn linear_master_table() {
        let table = master_frequency_table(16, 40, 0, false).unwrap();
        assert_eq!(table, (16..=40).collect::<Vec<_>>());

        let table = master_frequency_table(16, 41, 0, true).unwrap();
        assert_eq!(table[0], 16);
        assert_eq!(*table.last().unwrap(), 41);
        assert!(table.windows(2).all(|w| w[1] - w[0] >= 2));
    }

    #[test]
    fn derived_tables_respect_bounds() {
        for &rate in &[22050, 24000, 32000, 44100, 48000] {
            for start_freq in 0..16 {
                for stop_freq in 0..16 {
                    for xover_band in 0..3 {
                        let hdr = SbrHeader {
                            xover_band,
                            ..header(start_freq, stop_freq, 2)
                        };
                        if let Ok(tables) = FrequencyTables::new(&hdr, rate, true) {
                            assert!(tables.kx <= 32);
                            assert!(tables.kx + tables.m <= 64);
                            assert!(strictly_increasing(&tables.bands[1]));
                            assert!(strictly_increasing(&tables.bands[0]));
                            assert!(strictly_increasing(&tables.noise));
                            assert!((1..=5).contains(&tables.num_noise_bands()));
                            assert_eq!(tables.bands[0][0], tables.kx);
                            assert_eq!(*tables.bands[0].last().unwrap(), tables.kx + tables.m);

                            let covered: usize = tables.patches.iter().map(|p| p.len).sum();
                            assert!(covered <= tables.m);
                            for patch in &tables.patches {
                                assert!(patch.source + patch.len <= tables.kx);
                            }
                            for limiter in &tables.limiter {
                                assert_eq!(limiter[0], tables.kx);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn crossover_beyond_master_fails() {
        let hdr = SbrHeader {
            xover_band: 6,
            ..header(5, 0, 3)
        };
        assert_eq!(master_frequency_table(14, 23, 3, true).unwrap().len(), 7);
        match FrequencyTables::new(&hdr, 44100, true) {
            Err(Error::InvalidTables(_)) => {}
            other => panic!("unexpected {:?}", other.map(|t| t.master)),
        }
    }

    #[test]
    fn resolution_maps() {
        let tables = FrequencyTables::new(&header(5, 9, 2), 44100, true).unwrap();
        let low = &tables.bands[0];
        let high = &tables.bands[1];

        for (k, &i) in tables.high_to_low.iter().enumerate() {
            assert!(low[i] <= high[k] && high[k] < low[i + 1]);
        }
        for (k, &i) in tables.low_to_high.iter().enumerate() {
            assert_eq!(high[i], low[k]);
        }
    }
}
