//! Spectral Band Replication and Parametric Stereo decoding for HE-AAC.
//!
//! The decoder works between the core decoder's 32 band QMF analysis and the
//! 64 band QMF synthesis. For every frame it takes the SBR extension payload
//! and the analysed baseband, and produces the full band subband matrix of
//! each output channel.

use log::{debug, error, warn};
use num::Zero;

use std::ops::{Index, IndexMut};

mod error;
pub use error::Error;

mod data;
use data::*;

mod bits;
use bits::PayloadReader;

mod fbt;
pub use fbt::FrequencyTables;

mod syntax;
pub use syntax::SbrHeader;
use syntax::{
    read_channel_pair_element, read_extension_header, read_single_channel_element,
    ElementContext, ElementData,
};

mod ps_syntax;

mod dequant;
use dequant::{dequantize, dequantize_coupled, ChannelIndices, Energies};

mod hfgen;
mod hfadj;

mod ps;
use ps::{PsDecoder, PsParameters};

mod decoder;
use decoder::ChannelState;

pub use num::complex::Complex32;

/// Syntactic element the SBR data is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// Single channel element, optionally carrying parametric stereo.
    Single,
    /// Channel pair element.
    Pair,
}

/// Relation of the SBR output rate to the core decoder rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateMode {
    /// SBR output at twice the core rate.
    DualRate,
    /// Down-sampled SBR, output at the core rate.
    Downsampled,
}

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Sample rate of the SBR output.
    pub sample_rate: u32,
    pub element: ElementKind,
    /// Core frame length, 1024 or 960.
    pub frame_length: usize,
    pub rate_mode: RateMode,
    /// Synthesize stereo from PS data of a single channel element.
    pub ps_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sample_rate: 44100,
            element: ElementKind::Single,
            frame_length: 1024,
            rate_mode: RateMode::DualRate,
            ps_enabled: true,
        }
    }
}

impl Config {
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_element(mut self, element: ElementKind) -> Self {
        self.element = element;
        self
    }

    pub fn with_frame_length(mut self, frame_length: usize) -> Self {
        self.frame_length = frame_length;
        self
    }

    pub fn with_rate_mode(mut self, rate_mode: RateMode) -> Self {
        self.rate_mode = rate_mode;
        self
    }

    pub fn with_ps(mut self, ps_enabled: bool) -> Self {
        self.ps_enabled = ps_enabled;
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if !(8000..=96000).contains(&self.sample_rate) {
            return Err(Error::InvalidConfig(format!(
                "sample rate {} outside 8000..=96000",
                self.sample_rate
            )));
        }

        if self.frame_length != 1024 && self.frame_length != 960 {
            return Err(Error::InvalidConfig(format!(
                "frame length {} is neither 1024 nor 960",
                self.frame_length
            )));
        }

        Ok(())
    }

    /// SBR time slots per frame.
    fn num_time_slots(&self) -> usize {
        if self.frame_length == 960 {
            15
        } else {
            16
        }
    }
}

/// Complex QMF subband samples of one channel and frame, `slots[n][k]` for
/// time slot `n` and band `k`.
#[derive(Debug, Clone, PartialEq)]
pub struct QmfMatrix {
    pub slots: Vec<[Complex32; QMF_BANDS]>,
}

impl QmfMatrix {
    pub fn new(num_slots: usize) -> QmfMatrix {
        QmfMatrix {
            slots: vec![[Complex32::zero(); QMF_BANDS]; num_slots],
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }
}

impl Index<usize> for QmfMatrix {
    type Output = [Complex32; QMF_BANDS];

    fn index(&self, slot: usize) -> &Self::Output {
        &self.slots[slot]
    }
}

impl IndexMut<usize> for QmfMatrix {
    fn index_mut(&mut self, slot: usize) -> &mut Self::Output {
        &mut self.slots[slot]
    }
}

/// Everything decoded from one payload, not yet applied to the decoder.
struct StagedFrame {
    header: SbrHeader,
    /// Rebuilt tables, when the header requires a reset.
    tables: Option<FrequencyTables>,
    element: ElementData,
    indices: Vec<ChannelIndices>,
    energies: Vec<Energies>,
    ps: Option<PsParameters>,
}

/// SBR decoder of one syntactic element.
#[derive(Debug, Clone)]
pub struct SbrDecoder {
    config: Config,
    header: Option<SbrHeader>,
    tables: Option<FrequencyTables>,
    channels: Vec<ChannelState>,
    ps: Option<PsDecoder>,
    frame_number: u64,
}

impl SbrDecoder {
    pub fn new(config: Config) -> Result<SbrDecoder, Error> {
        config.validate()?;

        init_static();

        let num_slots = RATE * config.num_time_slots();
        let num_channels = match config.element {
            ElementKind::Single => 1,
            ElementKind::Pair => 2,
        };

        let ps = match config.element {
            ElementKind::Single if config.ps_enabled => Some(PsDecoder::new()),
            ElementKind::Pair if config.ps_enabled => {
                warn!("parametric stereo is only carried by single channel elements");
                None
            }
            _ => None,
        };

        Ok(SbrDecoder {
            config,
            header: None,
            tables: None,
            channels: vec![ChannelState::new(num_slots); num_channels],
            ps,
            frame_number: 0,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Header currently in force.
    pub fn header(&self) -> Option<&SbrHeader> {
        self.header.as_ref()
    }

    /// Frequency tables derived from the current header.
    pub fn tables(&self) -> Option<&FrequencyTables> {
        self.tables.as_ref()
    }

    /// Whether PS data has been received, so that the second output channel
    /// carries a synthesized stereo image rather than a copy of the first.
    pub fn ps_active(&self) -> bool {
        self.ps.as_ref().map_or(false, |ps| ps.is_active())
    }

    /// QMF slots per frame, the row count of every matrix.
    pub fn num_slots(&self) -> usize {
        RATE * self.config.num_time_slots()
    }

    /// Input matrices expected per frame.
    pub fn num_input_channels(&self) -> usize {
        self.channels.len()
    }

    /// Output matrices produced per frame.
    pub fn num_output_channels(&self) -> usize {
        if self.ps.is_some() {
            2
        } else {
            self.channels.len()
        }
    }

    /// Decodes one SBR extension payload. `payload` holds the extension's
    /// bytes, starting with the 4 bit extension type.
    ///
    /// On a payload error the baseband is passed through to `output`, the
    /// decoder state is left as it was, and the error is returned. Later
    /// frames decode normally.
    pub fn decode_frame(
        &mut self,
        payload: &[u8],
        input: &[QmfMatrix],
        output: &mut [QmfMatrix],
    ) -> Result<(), Error> {
        self.check_buffers(input, output)?;
        self.frame_number += 1;

        match self.parse(payload) {
            Ok(staged) => {
                self.apply(staged, input, output);
                Ok(())
            }
            Err(e) => {
                error!(
                    "frame {}: {}, passing the baseband through",
                    self.frame_number, e
                );
                self.passthrough_unchecked(input, output);
                Err(e)
            }
        }
    }

    /// Passes the baseband through for a frame without SBR data.
    pub fn passthrough(&mut self, input: &[QmfMatrix], output: &mut [QmfMatrix]) -> Result<(), Error> {
        self.check_buffers(input, output)?;
        self.frame_number += 1;
        self.passthrough_unchecked(input, output);

        Ok(())
    }

    fn check_buffers(&self, input: &[QmfMatrix], output: &mut [QmfMatrix]) -> Result<(), Error> {
        if input.len() != self.num_input_channels() {
            return Err(Error::ChannelMismatch {
                expected: self.num_input_channels(),
                got: input.len(),
            });
        }
        if output.len() != self.num_output_channels() {
            return Err(Error::ChannelMismatch {
                expected: self.num_output_channels(),
                got: output.len(),
            });
        }

        let num_slots = self.num_slots();
        if let Some(matrix) = input.iter().find(|m| m.num_slots() != num_slots) {
            return Err(Error::InvalidConfig(format!(
                "input matrix has {} slots, expected {}",
                matrix.num_slots(),
                num_slots
            )));
        }

        for matrix in output.iter_mut() {
            matrix
                .slots
                .resize(num_slots, [Complex32::zero(); QMF_BANDS]);
        }

        Ok(())
    }

    /// Parses and decodes the payload against the committed state without
    /// changing it.
    fn parse(&self, payload: &[u8]) -> Result<StagedFrame, Error> {
        let mut reader = PayloadReader::new(payload);

        let new_header = read_extension_header(&mut reader)?;
        let header = new_header.or(self.header).ok_or(Error::NoHeader)?;

        let new_tables = if self.tables.is_none() || header.requires_reset(self.header.as_ref()) {
            Some(FrequencyTables::new(
                &header,
                self.config.sample_rate,
                self.config.rate_mode == RateMode::DualRate,
            )?)
        } else {
            None
        };
        let tables = match new_tables.as_ref().or_else(|| self.tables.as_ref()) {
            Some(tables) => tables,
            None => return Err(Error::NoHeader),
        };

        let ctx = ElementContext {
            tables,
            header: &header,
            num_time_slots: self.config.num_time_slots(),
            ps_header: self.ps.as_ref().and_then(|ps| ps.header()),
        };
        let (element, ps_payload) = match self.config.element {
            ElementKind::Single => read_single_channel_element(&mut reader, &ctx)?,
            ElementKind::Pair => read_channel_pair_element(&mut reader, &ctx)?,
        };
        reader.finish()?;

        let indices: Vec<ChannelIndices> = self
            .channels
            .iter()
            .enumerate()
            .map(|(ch, state)| {
                let (grid, payload) = element.channel(ch);
                state.decode_indices(tables, grid, payload)
            })
            .collect();

        let energies = match &element {
            ElementData::Coupled { channels, .. } => {
                let [left, right] = dequantize_coupled(&indices[0], &indices[1], channels[0].amp_res);
                vec![left, right]
            }
            _ => indices
                .iter()
                .enumerate()
                .map(|(ch, indices)| dequantize(indices, element.channel(ch).1.amp_res))
                .collect(),
        };

        let ps = match &self.ps {
            Some(ps) => {
                let frame = ps_payload.as_ref().and_then(|p| p.frame.as_ref());
                if ps_payload.is_some() && frame.is_none() {
                    warn!("frame {}: PS data before any PS header", self.frame_number);
                }
                ps.decode_parameters(frame, self.num_slots())
            }
            None => None,
        };

        Ok(StagedFrame {
            header,
            tables: new_tables,
            element,
            indices,
            energies,
            ps,
        })
    }

    /// Commits a decoded frame and renders its output.
    fn apply(&mut self, staged: StagedFrame, input: &[QmfMatrix], output: &mut [QmfMatrix]) {
        if let Some(tables) = staged.tables {
            debug!(
                "frame {}: SBR reset, start {} stop {} xover {}",
                self.frame_number,
                staged.header.start_freq,
                staged.header.stop_freq,
                staged.header.xover_band
            );
            for state in self.channels.iter_mut() {
                state.reset(&tables);
            }
            self.tables = Some(tables);
        }
        self.header = Some(staged.header);

        let tables = match &self.tables {
            Some(tables) => tables,
            None => return,
        };

        for (ch, state) in self.channels.iter_mut().enumerate() {
            let (grid, payload) = staged.element.channel(ch);
            state.process(
                tables,
                &staged.header,
                grid,
                payload,
                &staged.indices[ch],
                &staged.energies[ch],
                &input[ch].slots,
                &mut output[ch].slots,
            );
        }

        if let Some(ps) = self.ps.as_mut() {
            let (left, right) = output.split_at_mut(1);
            match &staged.ps {
                Some(params) => ps.process(
                    params,
                    &input[0].slots,
                    &mut left[0].slots,
                    &mut right[0].slots,
                ),
                None => right[0].slots.copy_from_slice(&left[0].slots),
            }
        }
    }

    fn passthrough_unchecked(&mut self, input: &[QmfMatrix], output: &mut [QmfMatrix]) {
        for (ch, state) in self.channels.iter_mut().enumerate() {
            state.passthrough(&input[ch].slots, &mut output[ch].slots);
        }

        if self.ps.is_some() {
            let (left, right) = output.split_at_mut(1);
            right[0].slots.copy_from_slice(&left[0].slots);
        }
    }
}

/// Builds the lazily initialized tables up front, so that the first frame
/// does not pay for them.
pub fn init_static() {
    lazy_static::initialize(&F_HUFF_ENV_1_5DB);
    lazy_static::initialize(&T_HUFF_ENV_1_5DB);
    lazy_static::initialize(&F_HUFF_ENV_BAL_1_5DB);
    lazy_static::initialize(&T_HUFF_ENV_BAL_1_5DB);
    lazy_static::initialize(&F_HUFF_ENV_3_0DB);
    lazy_static::initialize(&T_HUFF_ENV_3_0DB);
    lazy_static::initialize(&F_HUFF_ENV_BAL_3_0DB);
    lazy_static::initialize(&T_HUFF_ENV_BAL_3_0DB);
    lazy_static::initialize(&T_HUFF_NOISE_3_0DB);
    lazy_static::initialize(&T_HUFF_NOISE_BAL_3_0DB);
    lazy_static::initialize(&F_HUFF_IID_DEF);
    lazy_static::initialize(&T_HUFF_IID_DEF);
    lazy_static::initialize(&F_HUFF_IID_FINE);
    lazy_static::initialize(&T_HUFF_IID_FINE);
    lazy_static::initialize(&F_HUFF_ICC);
    lazy_static::initialize(&T_HUFF_ICC);
    lazy_static::initialize(&F_HUFF_IPD);
    lazy_static::initialize(&T_HUFF_IPD);
    lazy_static::initialize(&F_HUFF_OPD);
    lazy_static::initialize(&T_HUFF_OPD);
    lazy_static::initialize(&QMF_FRACT);
    lazy_static::initialize(&HYBRID_FRACT_20);
    lazy_static::initialize(&HYBRID_FRACT_34);
    lazy_static::initialize(&HYBRID_FILTER_8_20);
    lazy_static::initialize(&HYBRID_FILTER_12_34);
    lazy_static::initialize(&HYBRID_FILTER_8_34);
    lazy_static::initialize(&HYBRID_FILTER_4_34);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::tests::PayloadWriter;
    use crate::syntax::tests::write_header;

    fn header() -> SbrHeader {
        SbrHeader {
            start_freq: 5,
            stop_freq: 9,
            ..SbrHeader::default()
        }
    }

    /// Single channel element, FIXFIX with one envelope. A FIXFIX frame with
    /// one envelope always codes 1.5 dB steps.
    fn sce_payload(with_header: bool, env_start: u32) -> Vec<u8> {
        let header = header();
        let tables = FrequencyTables::new(&header, 44100, true).unwrap();

        let mut w = PayloadWriter::new();
        w.write(4, EXT_SBR_DATA as u32).bit(with_header);
        if with_header {
            write_header(&mut w, &header);
        }
        // bs_data_extra, FIXFIX grid with one high resolution envelope.
        w.bit(false).write(2, 0).write(2, 0).bit(true);
        // Frequency direction envelope and noise floor.
        w.bit(false).bit(false);
        for _ in 0..tables.num_noise_bands() {
            w.write(2, 2);
        }
        w.write(7, env_start);
        for _ in 1..tables.num_bands(true) {
            w.code(&ENV_1_5DB_F, 0);
        }
        w.write(5, 10);
        for _ in 1..tables.num_noise_bands() {
            w.code(&ENV_3_0DB_F, 0);
        }
        // No sinusoids, no extended data.
        w.bit(false).bit(false);
        w.into_bytes()
    }

    fn input(seed: usize) -> Vec<QmfMatrix> {
        let mut matrix = QmfMatrix::new(32);
        for (n, row) in matrix.slots.iter_mut().enumerate() {
            for (k, value) in row.iter_mut().enumerate().take(32) {
                *value = Complex32::new(
                    (((n + seed) * 7 + k * 3) % 11) as f32 - 5.0,
                    (((n + seed) * 5 + k) % 7) as f32 - 3.0,
                );
            }
        }
        vec![matrix]
    }

    fn outputs(count: usize) -> Vec<QmfMatrix> {
        vec![QmfMatrix::new(32); count]
    }

    #[test]
    fn config_validation() {
        assert!(SbrDecoder::new(Config::default()).is_ok());
        assert!(SbrDecoder::new(Config::default().with_sample_rate(4000)).is_err());
        assert!(SbrDecoder::new(Config::default().with_frame_length(512)).is_err());

        let decoder = SbrDecoder::new(Config::default().with_frame_length(960)).unwrap();
        assert_eq!(decoder.num_slots(), 30);
        assert_eq!(decoder.num_output_channels(), 2);

        let decoder = SbrDecoder::new(Config::default().with_ps(false)).unwrap();
        assert_eq!(decoder.num_output_channels(), 1);

        let decoder =
            SbrDecoder::new(Config::default().with_element(ElementKind::Pair)).unwrap();
        assert_eq!(decoder.num_input_channels(), 2);
        assert_eq!(decoder.num_output_channels(), 2);
    }

    #[test]
    fn buffer_counts_are_checked() {
        let mut decoder = SbrDecoder::new(Config::default()).unwrap();
        let mut output = outputs(1);
        match decoder.decode_frame(&sce_payload(true, 40), &input(0), &mut output) {
            Err(Error::ChannelMismatch {
                expected: 2,
                got: 1,
            }) => {}
            other => panic!("unexpected {:?}", other),
        }

        let short = vec![QmfMatrix::new(30)];
        let mut output = outputs(2);
        assert!(decoder
            .decode_frame(&sce_payload(true, 40), &short, &mut output)
            .is_err());
        assert!(decoder.header().is_none());
    }

    #[test]
    fn frame_without_header_passes_through() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut decoder = SbrDecoder::new(Config::default()).unwrap();
        let input = input(0);
        let mut output = outputs(2);

        match decoder.decode_frame(&sce_payload(false, 40), &input, &mut output) {
            Err(Error::NoHeader) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(decoder.header().is_none());
        assert_eq!(&output[0].slots[6..], &input[0].slots[..26]);
        assert_eq!(output[0], output[1]);
    }

    #[test]
    fn decodes_header_and_envelope() {
        let mut decoder = SbrDecoder::new(Config::default().with_ps(false)).unwrap();
        let mut output = outputs(1);

        decoder
            .decode_frame(&sce_payload(true, 40), &input(0), &mut output)
            .unwrap();
        decoder
            .decode_frame(&sce_payload(false, 40), &input(1), &mut output)
            .unwrap();

        assert_eq!(decoder.header(), Some(&header()));
        let tables = decoder.tables().unwrap();
        let (kx, m) = (tables.start_channel(), tables.num_sbr_channels());

        let high_energy: f32 = output[0]
            .slots
            .iter()
            .map(|row| row[kx..kx + m].iter().map(|v| v.norm_sqr()).sum::<f32>())
            .sum();
        assert!(high_energy > 0.0);
        assert!(output[0]
            .slots
            .iter()
            .all(|row| row[kx + m..].iter().all(|v| v.is_zero())));
    }

    #[test]
    fn identical_state_and_bits_give_identical_output() {
        let mut decoder = SbrDecoder::new(Config::default()).unwrap();
        let mut output = outputs(2);
        decoder
            .decode_frame(&sce_payload(true, 40), &input(0), &mut output)
            .unwrap();

        let mut twin = decoder.clone();
        let mut twin_output = outputs(2);

        let payload = sce_payload(false, 52);
        decoder.decode_frame(&payload, &input(1), &mut output).unwrap();
        twin.decode_frame(&payload, &input(1), &mut twin_output)
            .unwrap();

        assert_eq!(output, twin_output);
        // Without PS data the right channel repeats the left.
        assert!(!decoder.ps_active());
        assert_eq!(output[0], output[1]);
    }

    #[test]
    fn failed_frame_keeps_state() {
        let mut decoder = SbrDecoder::new(Config::default().with_ps(false)).unwrap();
        let mut output = outputs(1);
        decoder
            .decode_frame(&sce_payload(true, 40), &input(0), &mut output)
            .unwrap();

        let mut reference = decoder.clone();
        let mut reference_output = outputs(1);

        // Truncated payload.
        let payload = sce_payload(false, 52);
        assert!(decoder
            .decode_frame(&payload[..4], &input(1), &mut output)
            .is_err());
        reference.passthrough(&input(1), &mut reference_output).unwrap();
        assert_eq!(output, reference_output);

        decoder.decode_frame(&payload, &input(2), &mut output).unwrap();
        reference
            .decode_frame(&payload, &input(2), &mut reference_output)
            .unwrap();
        assert_eq!(output, reference_output);
    }
}
