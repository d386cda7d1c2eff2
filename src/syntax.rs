use crate::bits::PayloadReader;
use crate::data::*;
use crate::fbt::FrequencyTables;
use crate::ps_syntax::{read_ps_data, PsHeader, PsPayload};
use crate::Error;

use log::{trace, warn};

/// SBR header fields. Only the fields that feed the frequency tables trigger a
/// reset when they change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SbrHeader {
    pub amp_res: bool,
    pub start_freq: u8,
    pub stop_freq: u8,
    pub xover_band: u8,
    pub freq_scale: u8,
    pub alter_scale: bool,
    pub noise_bands: u8,
    pub limiter_bands: u8,
    pub limiter_gains: u8,
    pub interpol_freq: bool,
    pub smoothing_mode: bool,
}

impl Default for SbrHeader {
    fn default() -> Self {
        SbrHeader {
            amp_res: true,
            start_freq: 0,
            stop_freq: 0,
            xover_band: 0,
            freq_scale: 2,
            alter_scale: true,
            noise_bands: 2,
            limiter_bands: 2,
            limiter_gains: 2,
            interpol_freq: true,
            smoothing_mode: true,
        }
    }
}

impl SbrHeader {
    pub(crate) fn requires_reset(&self, previous: Option<&SbrHeader>) -> bool {
        match previous {
            None => true,
            Some(prev) => {
                self.start_freq != prev.start_freq
                    || self.stop_freq != prev.stop_freq
                    || self.freq_scale != prev.freq_scale
                    || self.alter_scale != prev.alter_scale
                    || self.xover_band != prev.xover_band
                    || self.noise_bands != prev.noise_bands
            }
        }
    }
}

fn read_header(reader: &mut PayloadReader) -> Result<SbrHeader, Error> {
    let mut header = SbrHeader {
        amp_res: reader.read_bit()?,
        start_freq: reader.read(4)?,
        stop_freq: reader.read(4)?,
        xover_band: reader.read(3)?,
        ..SbrHeader::default()
    };
    reader.skip(2)?;

    let extra_1 = reader.read_bit()?;
    let extra_2 = reader.read_bit()?;

    if extra_1 {
        header.freq_scale = reader.read(2)?;
        header.alter_scale = reader.read_bit()?;
        header.noise_bands = reader.read(2)?;
    }

    if extra_2 {
        header.limiter_bands = reader.read(2)?;
        header.limiter_gains = reader.read(2)?;
        header.interpol_freq = reader.read_bit()?;
        header.smoothing_mode = reader.read_bit()?;
    }

    Ok(header)
}

/// Reads the extension type and, if present, the SBR header.
pub(crate) fn read_extension_header(
    reader: &mut PayloadReader,
) -> Result<Option<SbrHeader>, Error> {
    let extension_type = reader.read::<u8>(4)?;
    match extension_type {
        EXT_SBR_DATA => {}
        EXT_SBR_DATA_CRC => reader.skip(10)?,
        other => return Err(Error::UnsupportedExtension(other)),
    }

    if reader.read_bit()? {
        Ok(Some(read_header(reader)?))
    } else {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum FrameClass {
    FixFix,
    FixVar,
    VarFix,
    VarVar,
}

impl FrameClass {
    fn from_bits(bits: u8) -> FrameClass {
        match bits & 3 {
            0 => FrameClass::FixFix,
            1 => FrameClass::FixVar,
            2 => FrameClass::VarFix,
            _ => FrameClass::VarVar,
        }
    }
}

/// Time segmentation of one SBR frame. Borders are in SBR time slots.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FrameGrid {
    pub class: FrameClass,
    pub num_env: usize,
    pub env_borders: [usize; MAX_ENVELOPES + 1],
    pub freq_res: [bool; MAX_ENVELOPES],
    pub num_noise: usize,
    pub noise_borders: [usize; MAX_NOISE_ENVELOPES + 1],
    pub pointer: usize,
    /// Envelope starting at a transient, `l_A`.
    pub transient_env: Option<usize>,
}

impl FrameGrid {
    /// Envelope index of the noise floor boundary when two noise floors are sent.
    fn middle_border(&self) -> usize {
        let border = match self.class {
            FrameClass::FixFix => self.num_env / 2,
            FrameClass::VarFix => match self.pointer {
                0 => 1,
                1 => self.num_env - 1,
                p => p - 1,
            },
            FrameClass::FixVar | FrameClass::VarVar => {
                if self.pointer > 1 {
                    self.num_env + 1 - self.pointer
                } else {
                    self.num_env - 1
                }
            }
        };

        border.min(self.num_env)
    }

    fn transient_envelope(&self) -> Option<usize> {
        match self.class {
            FrameClass::FixFix => None,
            FrameClass::VarFix => {
                if self.pointer > 1 {
                    Some(self.pointer - 1)
                } else {
                    None
                }
            }
            FrameClass::FixVar | FrameClass::VarVar => {
                if self.pointer > 0 {
                    Some(self.num_env + 1 - self.pointer)
                } else {
                    None
                }
            }
        }
    }

    /// Noise floor covering envelope `env`.
    pub(crate) fn noise_envelope_of(&self, env: usize) -> usize {
        let start = self.env_borders[env];
        (0..self.num_noise)
            .rev()
            .find(|&q| self.noise_borders[q] <= start)
            .unwrap_or(0)
    }
}

/// Bits needed to code a pointer with `values` possible values.
fn pointer_bits(values: usize) -> u32 {
    (usize::BITS - (values - 1).leading_zeros()) as u32
}

fn read_relative_borders(
    reader: &mut PayloadReader,
    count: usize,
    borders: &mut [usize],
) -> Result<(), Error> {
    for border in borders.iter_mut().take(count) {
        *border = 2 * (reader.read::<u32>(2)? as usize) + 2;
    }

    Ok(())
}

pub(crate) fn read_grid(
    reader: &mut PayloadReader,
    num_time_slots: usize,
) -> Result<FrameGrid, Error> {
    let class = FrameClass::from_bits(reader.read(2)?);

    let mut rel_lead = [0; 3];
    let mut rel_trail = [0; 3];
    let mut freq_res = [false; MAX_ENVELOPES];
    let mut pointer = 0;

    let (abs_lead, abs_trail, num_rel_lead, num_rel_trail, num_env) = match class {
        FrameClass::FixFix => {
            let num_env: usize = 1 << reader.read::<u32>(2)?;
            if num_env > 4 {
                return Err(Error::InvalidGrid("FIXFIX frame with more than 4 envelopes"));
            }
            let res = reader.read_bit()?;
            for flag in freq_res.iter_mut().take(num_env) {
                *flag = res;
            }

            (0, num_time_slots, num_env - 1, 0, num_env)
        }
        FrameClass::FixVar => {
            let abs_trail = (reader.read::<u32>(2)? as usize) + num_time_slots;
            let num_rel_trail = reader.read::<u32>(2)? as usize;
            read_relative_borders(reader, num_rel_trail, &mut rel_trail)?;
            let num_env = num_rel_trail + 1;

            pointer = reader.read::<u32>(pointer_bits(num_env + 1))? as usize;
            for env in 0..num_env {
                freq_res[num_env - 1 - env] = reader.read_bit()?;
            }

            (0, abs_trail, 0, num_rel_trail, num_env)
        }
        FrameClass::VarFix => {
            let abs_lead = reader.read::<u32>(2)? as usize;
            let num_rel_lead = reader.read::<u32>(2)? as usize;
            read_relative_borders(reader, num_rel_lead, &mut rel_lead)?;
            let num_env = num_rel_lead + 1;

            pointer = reader.read::<u32>(pointer_bits(num_env + 1))? as usize;
            for flag in freq_res.iter_mut().take(num_env) {
                *flag = reader.read_bit()?;
            }

            (abs_lead, num_time_slots, num_rel_lead, 0, num_env)
        }
        FrameClass::VarVar => {
            let abs_lead = reader.read::<u32>(2)? as usize;
            let abs_trail = (reader.read::<u32>(2)? as usize) + num_time_slots;
            let num_rel_lead = reader.read::<u32>(2)? as usize;
            let num_rel_trail = reader.read::<u32>(2)? as usize;
            let num_env = num_rel_lead + num_rel_trail + 1;
            if num_env > MAX_ENVELOPES {
                return Err(Error::InvalidGrid("VARVAR frame with more than 5 envelopes"));
            }
            read_relative_borders(reader, num_rel_lead, &mut rel_lead)?;
            read_relative_borders(reader, num_rel_trail, &mut rel_trail)?;

            pointer = reader.read::<u32>(pointer_bits(num_env + 1))? as usize;
            for flag in freq_res.iter_mut().take(num_env) {
                *flag = reader.read_bit()?;
            }

            (abs_lead, abs_trail, num_rel_lead, num_rel_trail, num_env)
        }
    };

    if pointer > num_env + 1 {
        return Err(Error::InvalidGrid("transient pointer beyond the last envelope"));
    }

    let mut env_borders = [0; MAX_ENVELOPES + 1];
    env_borders[0] = abs_lead;
    env_borders[num_env] = abs_trail;

    if class == FrameClass::FixFix {
        for (env, border) in env_borders.iter_mut().enumerate().take(num_env).skip(1) {
            *border = env * (num_time_slots / num_env);
        }
    } else {
        let mut border = abs_lead;
        for (i, rel) in rel_lead.iter().take(num_rel_lead).enumerate() {
            border += rel;
            env_borders[i + 1] = border;
        }

        let mut border = abs_trail;
        for (i, &rel) in rel_trail.iter().take(num_rel_trail).enumerate() {
            border = border
                .checked_sub(rel)
                .ok_or(Error::InvalidGrid("relative border before frame start"))?;
            env_borders[num_env - 1 - i] = border;
        }
    }

    if env_borders[..=num_env].windows(2).any(|w| w[0] >= w[1]) {
        return Err(Error::InvalidGrid("envelope borders not strictly increasing"));
    }

    let mut grid = FrameGrid {
        class,
        num_env,
        env_borders,
        freq_res,
        num_noise: if num_env > 1 { 2 } else { 1 },
        noise_borders: [0; MAX_NOISE_ENVELOPES + 1],
        pointer,
        transient_env: None,
    };

    grid.noise_borders[0] = env_borders[0];
    if grid.num_noise == 1 {
        grid.noise_borders[1] = env_borders[num_env];
    } else {
        grid.noise_borders[1] = env_borders[grid.middle_border()];
        grid.noise_borders[2] = env_borders[num_env];
    }
    grid.transient_env = grid.transient_envelope();

    trace!(
        "grid {:?}: {} envelopes {:?}, noise {:?}, transient {:?}",
        class,
        num_env,
        &env_borders[..=num_env],
        &grid.noise_borders[..=grid.num_noise],
        grid.transient_env
    );

    Ok(grid)
}

/// Side information of one channel, as coded. Envelope and noise values are
/// still delta coded; balance values are already scaled by two.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ChannelPayload {
    /// Effective amplitude resolution: true for 3.0 dB steps.
    pub amp_res: bool,
    pub env_time_diff: [bool; MAX_ENVELOPES],
    pub noise_time_diff: [bool; MAX_NOISE_ENVELOPES],
    pub invf_mode: [u8; MAX_NOISE_BANDS],
    pub env_deltas: Vec<Vec<i32>>,
    pub noise_deltas: Vec<Vec<i32>>,
    /// Sinusoid flags per high resolution band, empty when none are coded.
    pub add_harmonic: Vec<bool>,
    /// Values of this channel are balance values of a coupled pair.
    pub balance: bool,
}

/// One channel's grid and payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChannelFrame {
    pub grid: FrameGrid,
    pub payload: ChannelPayload,
}

/// Parsed SBR element data.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ElementData {
    Single(ChannelFrame),
    Pair([ChannelFrame; 2]),
    /// Coupled stereo, the channels share one grid. The first channel carries
    /// the sum, the second the balance.
    Coupled {
        grid: FrameGrid,
        channels: [ChannelPayload; 2],
    },
}

impl ElementData {
    pub(crate) fn channel(&self, ch: usize) -> (&FrameGrid, &ChannelPayload) {
        match self {
            ElementData::Single(frame) => (&frame.grid, &frame.payload),
            ElementData::Pair(frames) => (&frames[ch].grid, &frames[ch].payload),
            ElementData::Coupled { grid, channels } => (grid, &channels[ch]),
        }
    }

    pub(crate) fn num_channels(&self) -> usize {
        match self {
            ElementData::Single(_) => 1,
            _ => 2,
        }
    }
}

fn read_dtdf(
    reader: &mut PayloadReader,
    grid: &FrameGrid,
    payload: &mut ChannelPayload,
) -> Result<(), Error> {
    for flag in payload.env_time_diff.iter_mut().take(grid.num_env) {
        *flag = reader.read_bit()?;
    }
    for flag in payload.noise_time_diff.iter_mut().take(grid.num_noise) {
        *flag = reader.read_bit()?;
    }

    Ok(())
}

fn read_invf(
    reader: &mut PayloadReader,
    tables: &FrequencyTables,
    payload: &mut ChannelPayload,
) -> Result<(), Error> {
    for mode in payload.invf_mode.iter_mut().take(tables.num_noise_bands()) {
        *mode = reader.read(2)?;
    }

    Ok(())
}

fn read_envelope(
    reader: &mut PayloadReader,
    tables: &FrequencyTables,
    grid: &FrameGrid,
    payload: &mut ChannelPayload,
    amp_res: bool,
) -> Result<(), Error> {
    let amp_res = amp_res && !(grid.class == FrameClass::FixFix && grid.num_env == 1);
    payload.amp_res = amp_res;

    let shift = payload.balance as u32;
    let (f_huff, t_huff, start_bits): (&HuffmanTree, &HuffmanTree, u32) =
        match (payload.balance, amp_res) {
            (false, false) => (&F_HUFF_ENV_1_5DB, &T_HUFF_ENV_1_5DB, 7),
            (false, true) => (&F_HUFF_ENV_3_0DB, &T_HUFF_ENV_3_0DB, 6),
            (true, false) => (&F_HUFF_ENV_BAL_1_5DB, &T_HUFF_ENV_BAL_1_5DB, 6),
            (true, true) => (&F_HUFF_ENV_BAL_3_0DB, &T_HUFF_ENV_BAL_3_0DB, 5),
        };

    payload.env_deltas.clear();
    for env in 0..grid.num_env {
        let num_bands = tables.num_bands(grid.freq_res[env]);
        let mut deltas = Vec::with_capacity(num_bands);

        if payload.env_time_diff[env] {
            for _ in 0..num_bands {
                deltas.push(reader.read_huffman(t_huff)? << shift);
            }
        } else {
            deltas.push(reader.read::<i32>(start_bits)? << shift);
            for _ in 1..num_bands {
                deltas.push(reader.read_huffman(f_huff)? << shift);
            }
        }

        payload.env_deltas.push(deltas);
    }

    Ok(())
}

fn read_noise(
    reader: &mut PayloadReader,
    tables: &FrequencyTables,
    grid: &FrameGrid,
    payload: &mut ChannelPayload,
) -> Result<(), Error> {
    let shift = payload.balance as u32;
    let (f_huff, t_huff): (&HuffmanTree, &HuffmanTree) = if payload.balance {
        (&F_HUFF_ENV_BAL_3_0DB, &T_HUFF_NOISE_BAL_3_0DB)
    } else {
        (&F_HUFF_ENV_3_0DB, &T_HUFF_NOISE_3_0DB)
    };

    let num_bands = tables.num_noise_bands();

    payload.noise_deltas.clear();
    for noise in 0..grid.num_noise {
        let mut deltas = Vec::with_capacity(num_bands);

        if payload.noise_time_diff[noise] {
            for _ in 0..num_bands {
                deltas.push(reader.read_huffman(t_huff)? << shift);
            }
        } else {
            deltas.push(reader.read::<i32>(5)? << shift);
            for _ in 1..num_bands {
                deltas.push(reader.read_huffman(f_huff)? << shift);
            }
        }

        payload.noise_deltas.push(deltas);
    }

    Ok(())
}

fn read_sinusoidal_coding(
    reader: &mut PayloadReader,
    tables: &FrequencyTables,
    payload: &mut ChannelPayload,
) -> Result<(), Error> {
    payload.add_harmonic.clear();
    if reader.read_bit()? {
        for _ in 0..tables.num_bands(true) {
            payload.add_harmonic.push(reader.read_bit()?);
        }
    }

    Ok(())
}

/// Parses the extended data loop. Returns the PS payload, if any.
fn read_extended_data(
    reader: &mut PayloadReader,
    ps_allowed: bool,
    ps_header: Option<&PsHeader>,
) -> Result<Option<PsPayload>, Error> {
    if !reader.read_bit()? {
        return Ok(None);
    }

    let mut cnt = reader.read::<u32>(4)? as usize;
    if cnt == 15 {
        cnt += reader.read::<u32>(8)? as usize;
    }

    let mut ps = None;
    let mut bits_left = 8 * cnt;
    while bits_left > 7 {
        let extension_id = reader.read::<u8>(2)?;
        bits_left -= 2;

        let start = reader.position();
        if extension_id == EXTENSION_ID_PS && ps_allowed {
            let header = ps.as_ref().and_then(|p: &PsPayload| p.header).or(ps_header.copied());
            ps = Some(read_ps_data(reader, header.as_ref())?);
        } else {
            if extension_id == EXTENSION_ID_PS {
                warn!("parametric stereo data in a channel pair element ignored");
            }
            reader.skip(bits_left)?;
        }

        let used = reader.position() - start;
        if used > bits_left {
            return Err(Error::PayloadOverrun {
                read: used,
                available: bits_left,
            });
        }
        bits_left -= used;
    }
    reader.skip(bits_left)?;

    Ok(ps)
}

pub(crate) struct ElementContext<'a> {
    pub tables: &'a FrequencyTables,
    pub header: &'a SbrHeader,
    pub num_time_slots: usize,
    pub ps_header: Option<&'a PsHeader>,
}

pub(crate) fn read_single_channel_element(
    reader: &mut PayloadReader,
    ctx: &ElementContext,
) -> Result<(ElementData, Option<PsPayload>), Error> {
    if reader.read_bit()? {
        reader.skip(4)?;
    }

    let grid = read_grid(reader, ctx.num_time_slots)?;
    let mut payload = ChannelPayload::default();
    read_dtdf(reader, &grid, &mut payload)?;
    read_invf(reader, ctx.tables, &mut payload)?;
    read_envelope(reader, ctx.tables, &grid, &mut payload, ctx.header.amp_res)?;
    read_noise(reader, ctx.tables, &grid, &mut payload)?;
    read_sinusoidal_coding(reader, ctx.tables, &mut payload)?;

    let ps = read_extended_data(reader, true, ctx.ps_header)?;

    Ok((ElementData::Single(ChannelFrame { grid, payload }), ps))
}

pub(crate) fn read_channel_pair_element(
    reader: &mut PayloadReader,
    ctx: &ElementContext,
) -> Result<(ElementData, Option<PsPayload>), Error> {
    if reader.read_bit()? {
        reader.skip(8)?;
    }

    let amp_res = ctx.header.amp_res;
    let element = if reader.read_bit()? {
        let grid = read_grid(reader, ctx.num_time_slots)?;
        let mut sum = ChannelPayload::default();
        let mut balance = ChannelPayload {
            balance: true,
            ..ChannelPayload::default()
        };

        read_dtdf(reader, &grid, &mut sum)?;
        read_dtdf(reader, &grid, &mut balance)?;
        read_invf(reader, ctx.tables, &mut sum)?;
        balance.invf_mode = sum.invf_mode;

        read_envelope(reader, ctx.tables, &grid, &mut sum, amp_res)?;
        read_noise(reader, ctx.tables, &grid, &mut sum)?;
        read_envelope(reader, ctx.tables, &grid, &mut balance, amp_res)?;
        read_noise(reader, ctx.tables, &grid, &mut balance)?;

        read_sinusoidal_coding(reader, ctx.tables, &mut sum)?;
        read_sinusoidal_coding(reader, ctx.tables, &mut balance)?;

        ElementData::Coupled {
            grid,
            channels: [sum, balance],
        }
    } else {
        let grids = [
            read_grid(reader, ctx.num_time_slots)?,
            read_grid(reader, ctx.num_time_slots)?,
        ];
        let mut payloads = [ChannelPayload::default(), ChannelPayload::default()];

        for ch in 0..2 {
            read_dtdf(reader, &grids[ch], &mut payloads[ch])?;
        }
        for payload in payloads.iter_mut() {
            read_invf(reader, ctx.tables, payload)?;
        }
        for ch in 0..2 {
            read_envelope(reader, ctx.tables, &grids[ch], &mut payloads[ch], amp_res)?;
        }
        for ch in 0..2 {
            read_noise(reader, ctx.tables, &grids[ch], &mut payloads[ch])?;
        }
        for payload in payloads.iter_mut() {
            read_sinusoidal_coding(reader, ctx.tables, payload)?;
        }

        let [grid0, grid1] = grids;
        let [payload0, payload1] = payloads;
        ElementData::Pair([
            ChannelFrame {
                grid: grid0,
                payload: payload0,
            },
            ChannelFrame {
                grid: grid1,
                payload: payload1,
            },
        ])
    };

    let ps = read_extended_data(reader, false, None)?;

    Ok((element, ps))
}
