use crate::data::*;
use crate::dequant::{decode_indices, ChannelIndices, Energies, PreviousIndices};
use crate::fbt::FrequencyTables;
use crate::hfadj::{adjust, AdjusterState};
use crate::hfgen::{chirp_factors, generate_high_band, QmfRow};
use crate::syntax::{ChannelPayload, FrameGrid, SbrHeader};

use num::complex::Complex32;
use num::Zero;

/// Persistent SBR state of one channel.
///
/// `x` holds `HF_GEN_HISTORY` rows of the previous frame followed by the
/// current frame's QMF slots. High band generation and adjustment address
/// row `slot + HF_ADJ`, so the output rows `HF_ADJ..HF_ADJ + num_slots` lag
/// the input by `HF_GEN_HISTORY - HF_ADJ` slots.
#[derive(Debug, Clone)]
pub(crate) struct ChannelState {
    x: Vec<QmfRow>,
    num_slots: usize,
    prev: PreviousIndices,
    invf_prev: [u8; MAX_NOISE_BANDS],
    bw_prev: [f32; MAX_NOISE_BANDS],
    adjuster: AdjusterState,
}

impl ChannelState {
    pub(crate) fn new(num_slots: usize) -> ChannelState {
        ChannelState {
            x: vec![[Complex32::zero(); QMF_BANDS]; num_slots + HF_GEN_HISTORY],
            num_slots,
            prev: PreviousIndices::default(),
            invf_prev: [0; MAX_NOISE_BANDS],
            bw_prev: [0.0; MAX_NOISE_BANDS],
            adjuster: AdjusterState::default(),
        }
    }

    /// Adapts the carried state to freshly derived frequency tables.
    pub(crate) fn reset(&mut self, tables: &FrequencyTables) {
        self.prev.fit(tables);
        self.adjuster.reset();
    }

    /// Delta decodes this frame's indices against the committed history,
    /// leaving the history untouched.
    pub(crate) fn decode_indices(
        &self,
        tables: &FrequencyTables,
        grid: &FrameGrid,
        payload: &ChannelPayload,
    ) -> ChannelIndices {
        let mut prev = self.prev.clone();
        prev.fit(tables);

        decode_indices(tables, grid, payload, &prev)
    }

    /// Runs HF generation and adjustment over the current frame and writes
    /// the full band output. Also commits the frame's indices.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn process(
        &mut self,
        tables: &FrequencyTables,
        header: &SbrHeader,
        grid: &FrameGrid,
        payload: &ChannelPayload,
        indices: &ChannelIndices,
        energies: &Energies,
        input: &[QmfRow],
        output: &mut [QmfRow],
    ) {
        self.load_input(input, tables.kx);

        let num_noise_bands = tables.num_noise_bands();
        let bw = chirp_factors(
            num_noise_bands,
            &payload.invf_mode,
            &self.invf_prev,
            &self.bw_prev,
        );

        let first = RATE * grid.env_borders[0];
        let last = RATE * grid.env_borders[grid.num_env];
        generate_high_band(
            &mut self.x,
            tables,
            &bw,
            first,
            last,
            self.num_slots + HF_GEN_HISTORY - HF_ADJ,
        );

        adjust(
            &mut self.x,
            tables,
            header,
            grid,
            energies,
            &payload.add_harmonic,
            &mut self.adjuster,
        );

        self.prev = indices.to_previous(grid);
        self.invf_prev = payload.invf_mode;
        self.bw_prev = bw;

        self.write_output(output);
        self.shift();
    }

    /// Copies the baseband of all 64 bands through the delay line without
    /// any high band processing.
    pub(crate) fn passthrough(&mut self, input: &[QmfRow], output: &mut [QmfRow]) {
        self.load_input(input, QMF_BANDS);
        self.write_output(output);
        self.shift();
    }

    /// Places the input slots after the history, keeping bands below `kx`.
    fn load_input(&mut self, input: &[QmfRow], kx: usize) {
        for (row, slot) in self.x[HF_GEN_HISTORY..].iter_mut().zip(input.iter()) {
            row[..kx].copy_from_slice(&slot[..kx]);
            for value in row[kx..].iter_mut() {
                *value = Complex32::zero();
            }
        }
    }

    fn write_output(&self, output: &mut [QmfRow]) {
        let rows = &self.x[HF_ADJ..HF_ADJ + self.num_slots];
        for (out, row) in output.iter_mut().zip(rows.iter()) {
            *out = *row;
        }
    }

    /// Moves the last `HF_GEN_HISTORY` rows to the front for the next frame.
    fn shift(&mut self) {
        let len = self.x.len();
        self.x.copy_within(len - HF_GEN_HISTORY..len, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::tests::PayloadWriter;
    use crate::bits::PayloadReader;
    use crate::dequant::dequantize;
    use crate::syntax::read_grid;

    fn slots(num: usize, seed: usize) -> Vec<QmfRow> {
        (0..num)
            .map(|n| {
                let mut row = [Complex32::zero(); QMF_BANDS];
                for (k, value) in row.iter_mut().enumerate() {
                    *value = Complex32::new(
                        ((n * 31 + k * 17 + seed) % 13) as f32 - 6.0,
                        ((n * 7 + k * 5 + seed) % 9) as f32 - 4.0,
                    );
                }
                row
            })
            .collect()
    }

    fn silent(num: usize) -> Vec<QmfRow> {
        vec![[Complex32::zero(); QMF_BANDS]; num]
    }

    #[test]
    fn passthrough_delays_by_six_slots() {
        let mut state = ChannelState::new(32);
        let first = slots(32, 0);
        let second = slots(32, 1);
        let mut out = silent(32);

        state.passthrough(&first, &mut out);
        assert!(out[..6].iter().all(|row| row.iter().all(|v| v.is_zero())));
        assert_eq!(&out[6..], &first[..26]);

        state.passthrough(&second, &mut out);
        assert_eq!(&out[..6], &first[26..]);
        assert_eq!(&out[6..], &second[..26]);
    }

    #[test]
    fn high_bands_of_the_input_are_replaced() {
        let header = SbrHeader {
            start_freq: 5,
            stop_freq: 9,
            ..SbrHeader::default()
        };
        let tables = FrequencyTables::new(&header, 44100, true).unwrap();

        // FIXFIX, one envelope at low resolution, 960 sample frame.
        let mut w = PayloadWriter::new();
        w.write(2, 0).write(2, 0).bit(false);
        let bytes = w.into_bytes();
        let grid = read_grid(&mut PayloadReader::new(&bytes), 15).unwrap();

        let payload = ChannelPayload {
            amp_res: true,
            invf_mode: [2; MAX_NOISE_BANDS],
            env_deltas: vec![vec![0; tables.num_bands(false)]],
            noise_deltas: vec![vec![0; tables.num_noise_bands()]],
            ..ChannelPayload::default()
        };

        let mut state = ChannelState::new(30);
        let indices = state.decode_indices(&tables, &grid, &payload);
        let energies = dequantize(&indices, payload.amp_res);

        let input = slots(30, 3);
        let mut out = silent(30);
        for _ in 0..2 {
            state.process(
                &tables, &header, &grid, &payload, &indices, &energies, &input, &mut out,
            );
        }

        // Second frame: rows 6.. come from this frame's input.
        for (n, row) in out.iter().enumerate().skip(6) {
            assert_eq!(&row[..tables.kx], &input[n - 6][..tables.kx]);
            assert!(row[tables.kx + tables.m..].iter().all(|v| v.is_zero()));
            assert!(row.iter().all(|v| v.re.is_finite() && v.im.is_finite()));
        }
        assert_eq!(state.invf_prev, [2; MAX_NOISE_BANDS]);
        assert!(state.bw_prev[0] > 0.0);
        assert_eq!(state.prev.env, indices.env[0]);
    }
}
