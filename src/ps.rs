use crate::data::*;
use crate::hfgen::QmfRow;
use crate::ps_syntax::{CodedParameters, PsFrame, PsHeader, MAX_PS_ENVELOPES};

use log::{debug, trace};
use num::complex::Complex32;
use num::Zero;

use std::f32::consts::{PI, SQRT_2};
use std::ops::Range;

const MAX_PAR_BANDS: usize = 34;
const MAX_IPD_BANDS: usize = 17;
const MAX_HYBRID: usize = 32;
/// QMF bands split by the hybrid analysis in the 34 band configuration.
const MAX_HYBRID_QMF: usize = 5;
const HYBRID_HISTORY: usize = HYBRID_TAPS - 1;

/// Subband and stereo band layout of one hybrid configuration.
#[derive(Debug)]
struct Layout {
    num_hybrid: usize,
    /// QMF bands replaced by hybrid subbands.
    num_qmf_hybrid: usize,
    /// Hybrid subbands summed back into each of those QMF bands.
    hybrid_split: &'static [usize],
    num_bands: usize,
    num_ipd_bands: usize,
    decay_cutoff: usize,
    group_border: &'static [usize],
    group_to_band: &'static [u8],
}

const LAYOUT_20: Layout = Layout {
    num_hybrid: 10,
    num_qmf_hybrid: 3,
    hybrid_split: &[0, 6, 8, 10],
    num_bands: 20,
    num_ipd_bands: 11,
    decay_cutoff: 3,
    group_border: &GROUP_BORDER_20,
    group_to_band: &GROUP_TO_BAND_20,
};

const LAYOUT_34: Layout = Layout {
    num_hybrid: 32,
    num_qmf_hybrid: 5,
    hybrid_split: &[0, 12, 20, 24, 28, 32],
    num_bands: 34,
    num_ipd_bands: 17,
    decay_cutoff: 5,
    group_border: &GROUP_BORDER_34,
    group_to_band: &GROUP_TO_BAND_34,
};

impl Layout {
    fn of(use34: bool) -> &'static Layout {
        if use34 {
            &LAYOUT_34
        } else {
            &LAYOUT_20
        }
    }

    fn num_subbands(&self) -> usize {
        self.num_hybrid + QMF_BANDS - self.num_qmf_hybrid
    }

    /// Position of a QMF band in the subband sequence.
    fn index_of_qmf(&self, band: usize) -> usize {
        band - self.num_qmf_hybrid + self.num_hybrid
    }

    fn subbands(&self, group: usize) -> Range<usize> {
        if group < self.num_hybrid {
            group..group + 1
        } else {
            self.index_of_qmf(self.group_border[group])
                ..self.index_of_qmf(self.group_border[group + 1])
        }
    }

    fn band_of_subbands(&self) -> Vec<usize> {
        let mut band_of = vec![0; self.num_subbands()];
        for (group, &entry) in self.group_to_band.iter().enumerate() {
            for band in band_of[self.subbands(group)].iter_mut() {
                *band = (entry & !NEGATE_IPD) as usize;
            }
        }
        band_of
    }

    fn hybrid_fract(&self) -> &'static [(Complex32, [Complex32; NUM_ALLPASS_LINKS])] {
        if self.num_hybrid == LAYOUT_34.num_hybrid {
            &HYBRID_FRACT_34
        } else {
            &HYBRID_FRACT_20
        }
    }
}

/// Dequantization indices of one PS envelope, in stereo band order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PsIndices {
    pub iid: [i32; MAX_PAR_BANDS],
    pub icc: [i32; MAX_PAR_BANDS],
    pub ipd: [i32; MAX_IPD_BANDS],
    pub opd: [i32; MAX_IPD_BANDS],
}

impl PsIndices {
    const ZERO: PsIndices = PsIndices {
        iid: [0; MAX_PAR_BANDS],
        icc: [0; MAX_PAR_BANDS],
        ipd: [0; MAX_IPD_BANDS],
        opd: [0; MAX_IPD_BANDS],
    };
}

/// Decoded PS side information of one frame, ready to be applied.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PsParameters {
    pub header: PsHeader,
    /// Envelope borders in QMF slots, `borders[0] == 0` and the last one is
    /// the frame length.
    pub borders: Vec<usize>,
    /// Per envelope indices, mapped onto the bands of the hybrid
    /// configuration in use.
    pub envelopes: Vec<PsIndices>,
    /// Last envelope as coded, the reference of the next frame's time deltas.
    pub last: PsIndices,
}

/// Accumulates one delta coded parameter set into `out`. Sets of 10 or 5
/// values cover two bins each.
fn delta_decode<F: Fn(i32) -> i32>(
    coded: Option<&CodedParameters>,
    prev: &[i32],
    out: &mut [i32],
    nr_par: usize,
    limit: F,
) {
    for value in out.iter_mut() {
        *value = 0;
    }

    let coded = match coded {
        Some(coded) => coded,
        None => return,
    };
    let stride = if nr_par == 10 || nr_par == 5 { 2 } else { 1 };

    let mut acc = 0;
    for (i, &delta) in coded.values.iter().enumerate().take(nr_par) {
        out[i] = if coded.time_diff {
            limit(prev[i * stride] + delta)
        } else {
            acc = limit(acc + delta);
            acc
        };
    }

    if stride == 2 {
        for i in (0..2 * nr_par).rev() {
            out[i] = out[i / 2];
        }
    }
}

/// Spreads values of the 20 band layout over the 34 bands. Only the first
/// 17 bands are mapped for phase parameters.
fn map_20_to_34(values: &mut [i32], full: bool) {
    let src: Vec<i32> = values[..20.min(values.len())].to_vec();

    values[0] = src[0];
    values[1] = (src[0] + src[1]) / 2;
    values[2] = src[1];
    values[3] = src[2];
    values[4] = (src[2] + src[3]) / 2;
    values[5] = src[3];
    values[6] = src[4];
    values[7] = src[4];
    values[8] = src[5];
    values[9] = src[5];
    values[10] = src[6];
    values[11] = src[7];
    values[12] = src[8];
    values[13] = src[8];
    values[14] = src[9];
    values[15] = src[9];
    values[16] = src[10];

    if full {
        values[17] = src[11];
        values[18] = src[12];
        values[19] = src[13];
        values[20] = src[14];
        values[21] = src[14];
        values[22] = src[15];
        values[23] = src[15];
        values[24] = src[16];
        values[25] = src[16];
        values[26] = src[17];
        values[27] = src[17];
        values[28] = src[18];
        values[29] = src[18];
        values[30] = src[18];
        values[31] = src[18];
        values[32] = src[19];
        values[33] = src[19];
    }
}

/// Envelope borders of a frame. Variable borders are extended to the frame
/// end and forced to be strictly increasing.
fn envelope_borders(frame: &PsFrame, num_slots: usize) -> Vec<usize> {
    let num_env = frame.num_env;

    if !frame.frame_class {
        return (0..=num_env).map(|e| e * num_slots / num_env).collect();
    }

    let mut borders: Vec<usize> = frame.borders[..=num_env].to_vec();
    borders[0] = 0;
    if borders[num_env] > num_slots {
        borders[num_env] = num_slots;
    }
    if borders[num_env] < num_slots {
        borders.push(num_slots);
    }

    let num_env = borders.len() - 1;
    for env in 1..num_env {
        let max = num_slots - (num_env - env);
        let min = borders[env - 1] + 1;
        borders[env] = borders[env].min(max).max(min);
    }

    borders
}

fn iid_limit(fine: bool) -> impl Fn(i32) -> i32 {
    let steps = (if fine {
        IID_STEPS_FINE
    } else {
        IID_STEPS_NORMAL
    }) as i32;
    move |v| v.max(-steps).min(steps)
}

fn icc_limit(v: i32) -> i32 {
    v.max(0).min(7)
}

fn phase_limit(v: i32) -> i32 {
    v & 7
}

/// Real mixing coefficients `[h11, h12, h21, h22]` for one stereo band.
fn mixing_coefficients(header: &PsHeader, iid: i32, icc: i32) -> [f32; 4] {
    let iid_db = if header.fine_iid() {
        IID_FINE_DB[(iid + IID_STEPS_FINE as i32) as usize]
    } else {
        IID_NORMAL_DB[(iid + IID_STEPS_NORMAL as i32) as usize]
    };
    let rho = ICC_RHO[icc as usize];
    let c = 10f32.powf(iid_db / 20.0);

    if !header.mixing_b() {
        let c1 = SQRT_2 / (1.0 + c * c).sqrt();
        let c2 = c * c1;
        let alpha = 0.5 * rho.acos();
        let beta = alpha * (c1 - c2) / SQRT_2;

        [
            c2 * (beta + alpha).cos(),
            c1 * (beta - alpha).cos(),
            c2 * (beta + alpha).sin(),
            c1 * (beta - alpha).sin(),
        ]
    } else {
        let rho = rho.max(0.05);
        let mut alpha = 0.5 * (2.0 * c * rho).atan2(c * c - 1.0);
        let mu = c + 1.0 / c;
        let mu = (1.0 + (4.0 * rho * rho - 4.0) / (mu * mu)).sqrt();
        let gamma = ((1.0 - mu) / (1.0 + mu)).sqrt().atan();
        if alpha < 0.0 {
            alpha += PI / 2.0;
        }

        [
            SQRT_2 * alpha.cos() * gamma.cos(),
            SQRT_2 * alpha.sin() * gamma.cos(),
            -SQRT_2 * alpha.sin() * gamma.sin(),
            SQRT_2 * alpha.cos() * gamma.sin(),
        ]
    }
}

fn phase_phasor(index: i32) -> Complex32 {
    Complex32::from_polar(&1.0, &(PI * index as f32 / 4.0))
}

/// Fixed length delay with wraparound position.
#[derive(Debug, Clone, Copy)]
struct DelayLine {
    buf: [Complex32; DELAY_LONG],
    len: usize,
    pos: usize,
}

impl DelayLine {
    fn new(len: usize) -> DelayLine {
        DelayLine {
            buf: [Complex32::new(0.0, 0.0); DELAY_LONG],
            len,
            pos: 0,
        }
    }

    /// Sample pushed `len` pushes ago.
    fn front(&self) -> Complex32 {
        self.buf[self.pos]
    }

    fn push(&mut self, value: Complex32) {
        self.buf[self.pos] = value;
        self.pos = (self.pos + 1) % self.len;
    }
}

#[derive(Debug, Clone)]
enum SubbandDecorrelator {
    Allpass {
        phi: Complex32,
        q: [Complex32; NUM_ALLPASS_LINKS],
        g: [f32; NUM_ALLPASS_LINKS],
        pre: DelayLine,
        links: [DelayLine; NUM_ALLPASS_LINKS],
    },
    Delay(DelayLine),
}

impl SubbandDecorrelator {
    fn allpass(
        (phi, q): (Complex32, [Complex32; NUM_ALLPASS_LINKS]),
        decay: f32,
    ) -> SubbandDecorrelator {
        let mut g = [0.0; NUM_ALLPASS_LINKS];
        for (g, &a) in g.iter_mut().zip(ALLPASS_FILTER_A.iter()) {
            *g = decay * a;
        }

        SubbandDecorrelator::Allpass {
            phi,
            q,
            g,
            pre: DelayLine::new(2),
            links: [
                DelayLine::new(ALLPASS_LINK_DELAY[0]),
                DelayLine::new(ALLPASS_LINK_DELAY[1]),
                DelayLine::new(ALLPASS_LINK_DELAY[2]),
            ],
        }
    }

    fn process(&mut self, input: Complex32) -> Complex32 {
        match self {
            SubbandDecorrelator::Allpass {
                phi,
                q,
                g,
                pre,
                links,
            } => {
                let mut r0 = *phi * pre.front();
                pre.push(input);

                for (m, link) in links.iter_mut().enumerate() {
                    let tmp = link.front() * q[m] - r0 * g[m];
                    link.push(r0 + tmp * g[m]);
                    r0 = tmp;
                }

                r0
            }
            SubbandDecorrelator::Delay(line) => {
                let out = line.front();
                line.push(input);
                out
            }
        }
    }
}

/// Ducks the decorrelated signal after onsets.
#[derive(Debug, Clone)]
struct TransientDetector {
    peak_decay: [f32; MAX_PAR_BANDS],
    power_smooth: [f32; MAX_PAR_BANDS],
    diff_smooth: [f32; MAX_PAR_BANDS],
}

impl TransientDetector {
    fn new() -> TransientDetector {
        TransientDetector {
            peak_decay: [0.0; MAX_PAR_BANDS],
            power_smooth: [0.0; MAX_PAR_BANDS],
            diff_smooth: [0.0; MAX_PAR_BANDS],
        }
    }

    fn ratio(&mut self, band: usize, power: f32) -> f32 {
        self.peak_decay[band] = (self.peak_decay[band] * PEAK_DECAY_FACTOR).max(power);
        self.power_smooth[band] += TRANSIENT_SMOOTH * (power - self.power_smooth[band]);
        self.diff_smooth[band] +=
            TRANSIENT_SMOOTH * (self.peak_decay[band] - power - self.diff_smooth[band]);

        let denom = TRANSIENT_IMPACT * self.diff_smooth[band];
        if denom > self.power_smooth[band] {
            self.power_smooth[band] / denom
        } else {
            1.0
        }
    }
}

/// Splits the lowest QMF bands into hybrid subbands.
#[derive(Debug, Clone)]
struct HybridAnalysis {
    history: [[Complex32; HYBRID_HISTORY]; MAX_HYBRID_QMF],
}

fn complex_filter(filter: &[[Complex32; HYBRID_TAPS]], taps: &[Complex32], out: &mut [Complex32]) {
    for (out, coefs) in out.iter_mut().zip(filter.iter()) {
        *out = coefs
            .iter()
            .zip(taps.iter())
            .fold(Complex32::zero(), |acc, (c, x)| acc + *c * *x);
    }
}

/// Two band real filter, returns the low and high half.
fn real_filter(taps: &[Complex32]) -> (Complex32, Complex32) {
    let mut even = Complex32::zero();
    let mut odd = Complex32::zero();
    for (m, x) in taps.iter().enumerate() {
        let p = P2_13_20[m.min(HYBRID_TAPS - 1 - m)];
        if m % 2 == 0 {
            even += *x * p;
        } else {
            odd += *x * p;
        }
    }

    (even + odd, even - odd)
}

impl HybridAnalysis {
    fn new() -> HybridAnalysis {
        HybridAnalysis {
            history: [[Complex32::new(0.0, 0.0); HYBRID_HISTORY]; MAX_HYBRID_QMF],
        }
    }

    /// Hybrid subbands of every slot, delayed by `HYBRID_HISTORY / 2` slots.
    fn analyse(&mut self, input: &[QmfRow], use34: bool) -> Vec<[Complex32; MAX_HYBRID]> {
        let mut out = vec![[Complex32::zero(); MAX_HYBRID]; input.len()];
        let mut buf = Vec::with_capacity(HYBRID_HISTORY + input.len());

        for band in 0..MAX_HYBRID_QMF {
            buf.clear();
            buf.extend_from_slice(&self.history[band]);
            buf.extend(input.iter().map(|row| row[band]));

            for (n, hybrid) in out.iter_mut().enumerate() {
                let taps = &buf[n..n + HYBRID_TAPS];

                if use34 {
                    match band {
                        0 => complex_filter(&HYBRID_FILTER_12_34, taps, &mut hybrid[0..12]),
                        1 => complex_filter(&HYBRID_FILTER_8_34, taps, &mut hybrid[12..20]),
                        _ => {
                            let start = 20 + 4 * (band - 2);
                            complex_filter(&HYBRID_FILTER_4_34, taps, &mut hybrid[start..start + 4])
                        }
                    }
                } else {
                    match band {
                        0 => {
                            let mut q = [Complex32::zero(); 8];
                            complex_filter(&HYBRID_FILTER_8_20, taps, &mut q);
                            hybrid[0] = q[6];
                            hybrid[1] = q[7];
                            hybrid[2] = q[0];
                            hybrid[3] = q[1];
                            hybrid[4] = q[2] + q[5];
                            hybrid[5] = q[3] + q[4];
                        }
                        1 => {
                            let (low, high) = real_filter(taps);
                            hybrid[6] = high;
                            hybrid[7] = low;
                        }
                        2 => {
                            let (low, high) = real_filter(taps);
                            hybrid[8] = low;
                            hybrid[9] = high;
                        }
                        _ => {}
                    }
                }
            }

            let len = buf.len();
            self.history[band].copy_from_slice(&buf[len - HYBRID_HISTORY..]);
        }

        out
    }
}

/// Parametric stereo decoder of one single channel element.
#[derive(Debug, Clone)]
pub(crate) struct PsDecoder {
    header: Option<PsHeader>,
    prev: PsIndices,
    use34: bool,
    hybrid: HybridAnalysis,
    decorrelators: Vec<SubbandDecorrelator>,
    band_of: Vec<usize>,
    transients: TransientDetector,
    /// Mixing matrix reached at the end of the previous frame, per group.
    h_prev: Vec<[Complex32; 4]>,
    ipd_hist: [[Complex32; 2]; MAX_IPD_BANDS],
    opd_hist: [[Complex32; 2]; MAX_IPD_BANDS],
}

impl PsDecoder {
    pub(crate) fn new() -> PsDecoder {
        let mut decoder = PsDecoder {
            header: None,
            prev: PsIndices::ZERO,
            use34: false,
            hybrid: HybridAnalysis::new(),
            decorrelators: Vec::new(),
            band_of: Vec::new(),
            transients: TransientDetector::new(),
            h_prev: Vec::new(),
            ipd_hist: [[Complex32::new(1.0, 0.0); 2]; MAX_IPD_BANDS],
            opd_hist: [[Complex32::new(1.0, 0.0); 2]; MAX_IPD_BANDS],
        };
        decoder.reset_layout(false);
        decoder
    }

    /// A PS header has been received; stereo output is synthesized from now on.
    pub(crate) fn is_active(&self) -> bool {
        self.header.is_some()
    }

    pub(crate) fn header(&self) -> Option<&PsHeader> {
        self.header.as_ref()
    }

    fn reset_layout(&mut self, use34: bool) {
        let layout = Layout::of(use34);
        let hybrid_fract = layout.hybrid_fract();

        self.decorrelators = (0..layout.num_subbands())
            .map(|i| {
                if i < layout.num_hybrid {
                    return SubbandDecorrelator::allpass(hybrid_fract[i], 1.0);
                }

                let band = i - layout.num_hybrid + layout.num_qmf_hybrid;
                if band <= NUM_ALLPASS_BANDS {
                    let decay = 1.0 - DECAY_SLOPE * band.saturating_sub(layout.decay_cutoff) as f32;
                    SubbandDecorrelator::allpass(QMF_FRACT[band], decay.max(0.0))
                } else if band < SHORT_DELAY_BAND {
                    SubbandDecorrelator::Delay(DelayLine::new(DELAY_LONG))
                } else {
                    SubbandDecorrelator::Delay(DelayLine::new(DELAY_SHORT))
                }
            })
            .collect();

        self.band_of = layout.band_of_subbands();
        self.transients = TransientDetector::new();

        let identity = [
            Complex32::new(1.0, 0.0),
            Complex32::new(1.0, 0.0),
            Complex32::zero(),
            Complex32::zero(),
        ];
        self.h_prev = vec![identity; layout.group_to_band.len()];
        self.ipd_hist = [[Complex32::new(1.0, 0.0); 2]; MAX_IPD_BANDS];
        self.opd_hist = [[Complex32::new(1.0, 0.0); 2]; MAX_IPD_BANDS];

        self.use34 = use34;
    }

    /// Decodes the parameters of a frame without touching the decoder
    /// state. `frame` is `None` when the frame carried no PS data, in which
    /// case the previous parameters are kept. Returns `None` while no PS
    /// header has been received.
    pub(crate) fn decode_parameters(
        &self,
        frame: Option<&PsFrame>,
        num_slots: usize,
    ) -> Option<PsParameters> {
        let header = match frame {
            Some(frame) => frame.header,
            None => self.header?,
        };

        let mut prev = self.prev;
        let mut envelopes = Vec::with_capacity(MAX_PS_ENVELOPES);

        let borders = match frame {
            Some(frame) if frame.num_env > 0 => {
                for env in 0..frame.num_env {
                    let mut indices = PsIndices::ZERO;

                    let iid = if header.enable_iid { frame.iid.get(env) } else { None };
                    delta_decode(
                        iid,
                        &prev.iid,
                        &mut indices.iid,
                        header.nr_iid_par(),
                        iid_limit(header.fine_iid()),
                    );

                    let icc = if header.enable_icc { frame.icc.get(env) } else { None };
                    delta_decode(icc, &prev.icc, &mut indices.icc, header.nr_icc_par(), icc_limit);

                    let (ipd, opd) = if frame.enable_ipdopd {
                        (frame.ipd.get(env), frame.opd.get(env))
                    } else {
                        (None, None)
                    };
                    let nr_ipdopd = header.nr_ipdopd_par();
                    delta_decode(ipd, &prev.ipd, &mut indices.ipd, nr_ipdopd, phase_limit);
                    delta_decode(opd, &prev.opd, &mut indices.opd, nr_ipdopd, phase_limit);

                    envelopes.push(indices);
                    prev = indices;
                }

                let borders = envelope_borders(frame, num_slots);
                if borders.len() - 1 > envelopes.len() {
                    envelopes.push(prev);
                }
                borders
            }
            _ => {
                let mut indices = prev;
                if !header.enable_iid {
                    indices.iid = [0; MAX_PAR_BANDS];
                }
                if !header.enable_icc {
                    indices.icc = [0; MAX_PAR_BANDS];
                }
                if frame.map_or(false, |frame| !frame.enable_ipdopd) {
                    indices.ipd = [0; MAX_IPD_BANDS];
                    indices.opd = [0; MAX_IPD_BANDS];
                }
                envelopes.push(indices);
                prev = indices;

                vec![0, num_slots]
            }
        };

        if header.use34() {
            for indices in envelopes.iter_mut() {
                if header.nr_iid_par() != MAX_PAR_BANDS {
                    map_20_to_34(&mut indices.iid, true);
                }
                if header.nr_icc_par() != MAX_PAR_BANDS {
                    map_20_to_34(&mut indices.icc, true);
                }
                if header.nr_ipdopd_par() != MAX_IPD_BANDS {
                    map_20_to_34(&mut indices.ipd, false);
                    map_20_to_34(&mut indices.opd, false);
                }
            }
        }

        trace!("PS borders {:?}, use34 {}", borders, header.use34());

        Some(PsParameters {
            header,
            borders,
            envelopes,
            last: prev,
        })
    }

    /// Mixing matrices `[h11, h12, h21, h22]` of one envelope, per group.
    fn mixing_matrices(
        &mut self,
        layout: &Layout,
        header: &PsHeader,
        indices: &PsIndices,
    ) -> Vec<[Complex32; 4]> {
        let mut phases = [(0.0, 0.0); MAX_IPD_BANDS];
        for (b, phase) in phases.iter_mut().enumerate().take(layout.num_ipd_bands) {
            let ipd = phase_phasor(indices.ipd[b]);
            let opd = phase_phasor(indices.opd[b]);

            let ipd_smooth = ipd + self.ipd_hist[b][0] * 0.5 + self.ipd_hist[b][1] * 0.25;
            let opd_smooth = opd + self.opd_hist[b][0] * 0.5 + self.opd_hist[b][1] * 0.25;
            self.ipd_hist[b] = [ipd, self.ipd_hist[b][0]];
            self.opd_hist[b] = [opd, self.opd_hist[b][0]];

            let phi1 = opd_smooth.arg();
            *phase = (phi1, phi1 - ipd_smooth.arg());
        }

        layout
            .group_to_band
            .iter()
            .map(|&entry| {
                let b = (entry & !NEGATE_IPD) as usize;
                let h = mixing_coefficients(header, indices.iid[b], indices.icc[b]);
                let mut m = [
                    Complex32::new(h[0], 0.0),
                    Complex32::new(h[1], 0.0),
                    Complex32::new(h[2], 0.0),
                    Complex32::new(h[3], 0.0),
                ];

                if b < layout.num_ipd_bands {
                    let (phi1, phi2) = phases[b];
                    let e1 = Complex32::from_polar(&1.0, &phi1);
                    let e2 = Complex32::from_polar(&1.0, &phi2);
                    m[0] *= e1;
                    m[2] *= e1;
                    m[1] *= e2;
                    m[3] *= e2;

                    if entry & NEGATE_IPD != 0 {
                        for value in m.iter_mut() {
                            *value = value.conj();
                        }
                    }
                }

                m
            })
            .collect()
    }

    /// Commits `params` and renders the stereo pair. `input` holds the
    /// current QMF input of the channel, `left` the SBR output, which is
    /// replaced by the left channel.
    pub(crate) fn process(
        &mut self,
        params: &PsParameters,
        input: &[QmfRow],
        left: &mut [QmfRow],
        right: &mut [QmfRow],
    ) {
        self.header = Some(params.header);
        self.prev = params.last;

        let use34 = params.header.use34();
        if use34 != self.use34 {
            debug!("PS hybrid configuration changed to {} bands", if use34 { 34 } else { 20 });
            self.reset_layout(use34);
        }
        let layout = Layout::of(use34);
        let num_subbands = layout.num_subbands();

        let hybrid = self.hybrid.analyse(input, use34);

        let targets: Vec<Vec<[Complex32; 4]>> = params
            .envelopes
            .iter()
            .map(|indices| self.mixing_matrices(layout, &params.header, indices))
            .collect();

        let mut h = self.h_prev.clone();
        let mut step = vec![[Complex32::zero(); 4]; h.len()];

        let mut s = vec![Complex32::zero(); num_subbands];
        let mut d = vec![Complex32::zero(); num_subbands];
        let mut l = vec![Complex32::zero(); num_subbands];
        let mut r = vec![Complex32::zero(); num_subbands];

        let mut env = 0;
        for n in 0..left.len() {
            if n == params.borders[env + 1] {
                env += 1;
            }
            if n == params.borders[env] {
                let len = (params.borders[env + 1] - params.borders[env]) as f32;
                for (g, step) in step.iter_mut().enumerate() {
                    for k in 0..4 {
                        step[k] = (targets[env][g][k] - h[g][k]) / len;
                    }
                }
            }

            s[..layout.num_hybrid].copy_from_slice(&hybrid[n][..layout.num_hybrid]);
            for band in layout.num_qmf_hybrid..QMF_BANDS {
                s[layout.index_of_qmf(band)] = left[n][band];
            }

            let mut power = [0.0; MAX_PAR_BANDS];
            for (i, value) in s.iter().enumerate() {
                power[self.band_of[i]] += value.norm_sqr();
            }
            let mut ratio = [1.0; MAX_PAR_BANDS];
            for (b, ratio) in ratio.iter_mut().enumerate().take(layout.num_bands) {
                *ratio = self.transients.ratio(b, power[b]);
            }

            for (i, decorrelator) in self.decorrelators.iter_mut().enumerate() {
                d[i] = decorrelator.process(s[i]) * ratio[self.band_of[i]];
            }

            for (g, h) in h.iter_mut().enumerate() {
                for k in 0..4 {
                    h[k] += step[g][k];
                }
                for i in layout.subbands(g) {
                    l[i] = h[0] * s[i] + h[2] * d[i];
                    r[i] = h[1] * s[i] + h[3] * d[i];
                }
            }

            for (band, w) in layout.hybrid_split.windows(2).enumerate() {
                left[n][band] = l[w[0]..w[1]]
                    .iter()
                    .fold(Complex32::zero(), |acc, v| acc + v);
                right[n][band] = r[w[0]..w[1]]
                    .iter()
                    .fold(Complex32::zero(), |acc, v| acc + v);
            }
            for band in layout.num_qmf_hybrid..QMF_BANDS {
                let i = layout.index_of_qmf(band);
                left[n][band] = l[i];
                right[n][band] = r[i];
            }
        }

        self.h_prev = h;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(iid_mode: u8, icc_mode: u8) -> PsHeader {
        PsHeader {
            enable_iid: true,
            iid_mode,
            enable_icc: true,
            icc_mode,
            enable_ext: false,
        }
    }

    fn coded(time_diff: bool, values: Vec<i32>) -> CodedParameters {
        CodedParameters { time_diff, values }
    }

    fn frame(header: PsHeader, iid: Vec<i32>, icc: Vec<i32>) -> PsFrame {
        PsFrame {
            header,
            frame_class: false,
            num_env: 1,
            borders: [0; MAX_PS_ENVELOPES + 1],
            iid: vec![coded(false, iid)],
            icc: vec![coded(false, icc)],
            enable_ipdopd: false,
            ipd: Vec::new(),
            opd: Vec::new(),
        }
    }

    fn rows(len: usize, seed: usize) -> Vec<QmfRow> {
        (0..len)
            .map(|n| {
                let mut row = [Complex32::zero(); QMF_BANDS];
                for (k, value) in row.iter_mut().enumerate() {
                    let a = ((n * 31 + k * 17 + seed) % 23) as f32 - 11.0;
                    let b = ((n * 7 + k * 29 + seed) % 19) as f32 - 9.0;
                    *value = Complex32::new(a / 11.0, b / 9.0);
                }
                row
            })
            .collect()
    }

    #[test]
    fn frequency_deltas_with_coarse_stride() {
        let mut out = [0; MAX_PAR_BANDS];
        let coded = coded(false, vec![1, 2, -1, 0, 9, -20, 0, 0, 0, 0]);
        delta_decode(Some(&coded), &[0; MAX_PAR_BANDS], &mut out, 10, iid_limit(false));

        assert_eq!(
            &out[..20],
            &[1, 1, 3, 3, 2, 2, 2, 2, 7, 7, -7, -7, -7, -7, -7, -7, -7, -7, -7, -7]
        );
    }

    #[test]
    fn time_deltas_read_expanded_history() {
        let mut prev = [0; MAX_PAR_BANDS];
        for (i, value) in prev.iter_mut().enumerate().take(20) {
            *value = (i / 2) as i32 % 8;
        }

        let mut out = [0; MAX_PAR_BANDS];
        let coded = coded(true, vec![1; 10]);
        delta_decode(Some(&coded), &prev, &mut out, 10, icc_limit);
        assert_eq!(&out[..6], &[1, 1, 2, 2, 3, 3]);
        assert_eq!(out[14], 7);
        assert_eq!(out[15], 7);

        let mut phases = [0; MAX_IPD_BANDS];
        let coded = CodedParameters {
            time_diff: true,
            values: vec![3; 5],
        };
        let prev_phase = [6; MAX_IPD_BANDS];
        delta_decode(Some(&coded), &prev_phase, &mut phases, 5, phase_limit);
        assert_eq!(&phases[..11], &[1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0]);
    }

    #[test]
    fn disabled_stream_is_zero() {
        let mut out = [5; MAX_PAR_BANDS];
        delta_decode(None, &[3; MAX_PAR_BANDS], &mut out, 20, icc_limit);
        assert!(out.iter().all(|&v| v == 0));
    }

    #[test]
    fn fixed_and_variable_borders() {
        let mut f = frame(header(1, 1), vec![0; 20], vec![0; 20]);
        f.num_env = 2;
        assert_eq!(envelope_borders(&f, 32), vec![0, 16, 32]);

        f.frame_class = true;
        f.num_env = 3;
        f.borders = [0, 5, 5, 20, 0, 0];
        assert_eq!(envelope_borders(&f, 32), vec![0, 5, 6, 20, 32]);

        f.num_env = 2;
        f.borders = [0, 31, 32, 0, 0, 0];
        assert_eq!(envelope_borders(&f, 30), vec![0, 29, 30]);
    }

    #[test]
    fn appended_envelope_repeats_the_last() {
        let decoder = PsDecoder::new();
        let mut f = frame(header(1, 1), vec![2; 20], vec![1; 20]);
        f.frame_class = true;
        f.borders = [0, 12, 0, 0, 0, 0];

        let params = decoder.decode_parameters(Some(&f), 32).unwrap();
        assert_eq!(params.borders, vec![0, 12, 32]);
        assert_eq!(params.envelopes.len(), 2);
        assert_eq!(params.envelopes[0], params.envelopes[1]);
    }

    #[test]
    fn twenty_band_values_spread_over_thirty_four() {
        let mut values = [0; MAX_PAR_BANDS];
        for (i, value) in values.iter_mut().enumerate().take(20) {
            *value = i as i32;
        }
        map_20_to_34(&mut values, true);
        assert_eq!(
            &values[..],
            &[
                0, 0, 1, 2, 2, 3, 4, 4, 5, 5, 6, 7, 8, 8, 9, 9, 10, 11, 12, 13, 14, 14, 15, 15,
                16, 16, 17, 17, 18, 18, 18, 18, 19, 19
            ][..]
        );

        let mut phases = [0; MAX_IPD_BANDS];
        for (i, value) in phases.iter_mut().enumerate().take(11) {
            *value = i as i32 % 8;
        }
        map_20_to_34(&mut phases, false);
        assert_eq!(phases[16], 2);
        assert_eq!(phases[1], 0);
    }

    #[test]
    fn neutral_parameters_give_identity_mix() {
        for &icc_mode in &[0, 3] {
            let h = mixing_coefficients(&header(0, icc_mode), 0, 0);
            let expected = [1.0, 1.0, 0.0, 0.0];
            for (h, e) in h.iter().zip(expected.iter()) {
                assert!((h - e).abs() < 1e-6, "{:?}", h);
            }
        }

        // Type A keeps the total power.
        let h = mixing_coefficients(&header(0, 0), 4, 3);
        let power: f32 = h.iter().map(|v| v * v).sum();
        assert!((power - 2.0).abs() < 1e-5);
    }

    #[test]
    fn zero_iid_and_full_coherence_give_identical_channels() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut decoder = PsDecoder::new();
        let f = frame(header(1, 1), vec![0; 20], vec![0; 20]);

        for frame_index in 0..3 {
            let params = decoder.decode_parameters(Some(&f), 32).unwrap();
            let input = rows(32, frame_index);
            let mut left = rows(32, frame_index + 100);
            let mut right = vec![[Complex32::zero(); QMF_BANDS]; 32];

            decoder.process(&params, &input, &mut left, &mut right);

            assert_eq!(left, right);
        }
        assert!(decoder.is_active());
    }

    #[test]
    fn missing_frame_keeps_previous_parameters() {
        let mut decoder = PsDecoder::new();
        assert!(decoder.decode_parameters(None, 32).is_none());

        let f = frame(header(0, 0), vec![3, -1, 0, 0, 0, 0, 0, 0, 0, 0], vec![2; 10]);
        let params = decoder.decode_parameters(Some(&f), 32).unwrap();
        let input = rows(32, 1);
        let mut left = rows(32, 2);
        let mut right = left.clone();
        decoder.process(&params, &input, &mut left, &mut right);

        let reused = decoder.decode_parameters(None, 32).unwrap();
        assert_eq!(reused.borders, vec![0, 32]);
        assert_eq!(reused.envelopes, vec![params.last]);
        assert_eq!(reused.envelopes[0].iid[0], 3);
        assert_eq!(reused.envelopes[0].iid[2], 2);
    }

    #[test]
    fn hybrid_mode_switch_resets_state() {
        let mut decoder = PsDecoder::new();
        let f20 = frame(header(1, 1), vec![1; 20], vec![1; 20]);
        let f34 = frame(header(2, 1), vec![0; 34], vec![1; 20]);

        for f in &[f20, f34] {
            let params = decoder.decode_parameters(Some(f), 32).unwrap();
            let input = rows(32, 3);
            let mut left = rows(32, 4);
            let mut right = vec![[Complex32::zero(); QMF_BANDS]; 32];
            decoder.process(&params, &input, &mut left, &mut right);

            assert_eq!(decoder.use34, f.header.use34());
            assert_eq!(decoder.decorrelators.len(), Layout::of(decoder.use34).num_subbands());
            assert!(right
                .iter()
                .all(|row| row.iter().all(|v| v.re.is_finite() && v.im.is_finite())));
        }
    }
}
