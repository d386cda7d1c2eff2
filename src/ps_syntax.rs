use crate::bits::PayloadReader;
use crate::data::*;
use crate::Error;

pub(crate) const NR_IID_PAR: [usize; 8] = [10, 20, 34, 10, 20, 34, 0, 0];
pub(crate) const NR_ICC_PAR: [usize; 8] = [10, 20, 34, 10, 20, 34, 0, 0];
pub(crate) const NR_IPDOPD_PAR: [usize; 8] = [5, 11, 17, 5, 11, 17, 0, 0];
const NUM_ENV: [[usize; 4]; 2] = [[0, 1, 2, 4], [1, 2, 3, 4]];

pub(crate) const MAX_PS_ENVELOPES: usize = 5;

/// Persistent PS configuration, sent in the PS header.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct PsHeader {
    pub enable_iid: bool,
    pub iid_mode: u8,
    pub enable_icc: bool,
    pub icc_mode: u8,
    pub enable_ext: bool,
}

impl PsHeader {
    pub(crate) fn nr_iid_par(&self) -> usize {
        NR_IID_PAR[self.iid_mode as usize]
    }

    pub(crate) fn nr_icc_par(&self) -> usize {
        NR_ICC_PAR[self.icc_mode as usize]
    }

    pub(crate) fn nr_ipdopd_par(&self) -> usize {
        NR_IPDOPD_PAR[self.iid_mode as usize]
    }

    /// Whether the 34 band hybrid configuration is in use.
    pub(crate) fn use34(&self) -> bool {
        (self.enable_iid && (self.iid_mode == 2 || self.iid_mode == 5))
            || (self.enable_icc && (self.icc_mode == 2 || self.icc_mode == 5))
    }

    pub(crate) fn fine_iid(&self) -> bool {
        self.iid_mode >= 3
    }

    /// Mixing procedure B is selected by the ICC quantization mode.
    pub(crate) fn mixing_b(&self) -> bool {
        self.icc_mode >= 3
    }
}

/// Delta coded parameter values of one envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct CodedParameters {
    pub time_diff: bool,
    pub values: Vec<i32>,
}

/// PS side information of one frame, still delta coded.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PsFrame {
    pub header: PsHeader,
    pub frame_class: bool,
    /// Transmitted envelopes, zero means "keep the previous parameters".
    pub num_env: usize,
    /// Envelope borders in QMF slots, index 0 is always 0.
    pub borders: [usize; MAX_PS_ENVELOPES + 1],
    pub iid: Vec<CodedParameters>,
    pub icc: Vec<CodedParameters>,
    pub enable_ipdopd: bool,
    pub ipd: Vec<CodedParameters>,
    pub opd: Vec<CodedParameters>,
}

/// Result of parsing one PS extension.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PsPayload {
    /// Header sent in this extension.
    pub header: Option<PsHeader>,
    /// Frame data, absent while no header has been received.
    pub frame: Option<PsFrame>,
}

fn read_ps_header(reader: &mut PayloadReader) -> Result<PsHeader, Error> {
    let mut header = PsHeader::default();

    header.enable_iid = reader.read_bit()?;
    if header.enable_iid {
        header.iid_mode = reader.read(3)?;
        if header.nr_iid_par() == 0 {
            return Err(Error::InvalidPs("reserved IID mode"));
        }
    }

    header.enable_icc = reader.read_bit()?;
    if header.enable_icc {
        header.icc_mode = reader.read(3)?;
        if header.nr_icc_par() == 0 {
            return Err(Error::InvalidPs("reserved ICC mode"));
        }
    }

    header.enable_ext = reader.read_bit()?;

    Ok(header)
}

fn read_parameters(
    reader: &mut PayloadReader,
    time_diff: bool,
    count: usize,
    t_huff: &HuffmanTree,
    f_huff: &HuffmanTree,
) -> Result<CodedParameters, Error> {
    let tree = if time_diff { t_huff } else { f_huff };
    let values = (0..count)
        .map(|_| reader.read_huffman(tree))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CodedParameters { time_diff, values })
}

fn read_ipdopd_extension(reader: &mut PayloadReader, frame: &mut PsFrame) -> Result<(), Error> {
    frame.enable_ipdopd = reader.read_bit()?;
    if frame.enable_ipdopd {
        let count = frame.header.nr_ipdopd_par();
        for _ in 0..frame.num_env {
            let dt = reader.read_bit()?;
            frame
                .ipd
                .push(read_parameters(reader, dt, count, &T_HUFF_IPD, &F_HUFF_IPD)?);
            let dt = reader.read_bit()?;
            frame
                .opd
                .push(read_parameters(reader, dt, count, &T_HUFF_OPD, &F_HUFF_OPD)?);
        }
    }
    reader.skip(1)?;

    Ok(())
}

/// Parses a PS extension payload. `header` is the PS header in force.
pub(crate) fn read_ps_data(
    reader: &mut PayloadReader,
    header: Option<&PsHeader>,
) -> Result<PsPayload, Error> {
    let new_header = if reader.read_bit()? {
        Some(read_ps_header(reader)?)
    } else {
        None
    };

    let header = match new_header.as_ref().or(header) {
        Some(header) => *header,
        None => {
            return Ok(PsPayload {
                header: None,
                frame: None,
            })
        }
    };

    let frame_class = reader.read_bit()?;
    let num_env = NUM_ENV[frame_class as usize][reader.read::<u32>(2)? as usize];

    let mut borders = [0; MAX_PS_ENVELOPES + 1];
    if frame_class {
        for border in borders.iter_mut().skip(1).take(num_env) {
            *border = reader.read::<u32>(5)? as usize + 1;
        }
    }

    let mut frame = PsFrame {
        header,
        frame_class,
        num_env,
        borders,
        iid: Vec::with_capacity(num_env),
        icc: Vec::with_capacity(num_env),
        enable_ipdopd: false,
        ipd: Vec::new(),
        opd: Vec::new(),
    };

    if header.enable_iid {
        let (t_huff, f_huff): (&HuffmanTree, &HuffmanTree) = if header.fine_iid() {
            (&T_HUFF_IID_FINE, &F_HUFF_IID_FINE)
        } else {
            (&T_HUFF_IID_DEF, &F_HUFF_IID_DEF)
        };
        for _ in 0..num_env {
            let dt = reader.read_bit()?;
            frame.iid.push(read_parameters(
                reader,
                dt,
                header.nr_iid_par(),
                t_huff,
                f_huff,
            )?);
        }
    }

    if header.enable_icc {
        for _ in 0..num_env {
            let dt = reader.read_bit()?;
            frame.icc.push(read_parameters(
                reader,
                dt,
                header.nr_icc_par(),
                &T_HUFF_ICC,
                &F_HUFF_ICC,
            )?);
        }
    }

    if header.enable_ext {
        let mut cnt = reader.read::<u32>(4)? as usize;
        if cnt == 15 {
            cnt += reader.read::<u32>(8)? as usize;
        }

        let mut bits_left = 8 * cnt;
        while bits_left > 7 {
            let extension_id = reader.read::<u8>(2)?;
            bits_left -= 2;

            let start = reader.position();
            if extension_id == 0 {
                read_ipdopd_extension(reader, &mut frame)?;
            }
            let used = reader.position() - start;
            if used > bits_left {
                return Err(Error::InvalidPs("PS extension longer than its count"));
            }
            bits_left -= used;

            if extension_id != 0 {
                reader.skip(bits_left)?;
                bits_left = 0;
            }
        }
        reader.skip(bits_left)?;
    }

    Ok(PsPayload {
        header: new_header,
        frame: Some(frame),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bits::tests::PayloadWriter;

    pub(crate) fn write_ps_header(w: &mut PayloadWriter, iid_mode: u8, icc_mode: u8) {
        w.bit(true)
            .bit(true)
            .write(3, iid_mode as u32)
            .bit(true)
            .write(3, icc_mode as u32)
            .bit(false);
    }

    #[test]
    fn data_without_header_is_skipped() {
        let mut w = PayloadWriter::new();
        w.bit(false).write(7, 0);
        let bytes = w.into_bytes();

        let mut reader = PayloadReader::new(&bytes);
        let payload = read_ps_data(&mut reader, None).unwrap();
        assert_eq!(payload.header, None);
        assert_eq!(payload.frame, None);
        assert_eq!(reader.position(), 1);
    }

    #[test]
    fn parses_header_and_envelopes() {
        let mut w = PayloadWriter::new();
        write_ps_header(&mut w, 1, 0);
        // Fixed borders, two envelopes.
        w.bit(false).write(2, 2);
        for _ in 0..2 {
            w.bit(false);
            for _ in 0..20 {
                w.code(&IID_DEF_DF, 0);
            }
        }
        for _ in 0..2 {
            w.bit(true);
            for _ in 0..10 {
                w.code(&ICC_DT, 1);
            }
        }
        let bits = w.bits();
        let bytes = w.into_bytes();

        let mut reader = PayloadReader::new(&bytes);
        let payload = read_ps_data(&mut reader, None).unwrap();
        assert_eq!(reader.position(), bits);

        let header = payload.header.unwrap();
        assert!(!header.use34());
        assert!(!header.mixing_b());

        let frame = payload.frame.unwrap();
        assert_eq!(frame.num_env, 2);
        assert_eq!(frame.iid.len(), 2);
        assert_eq!(frame.iid[1].values, vec![0; 20]);
        assert!(frame.icc[0].time_diff);
        assert_eq!(frame.icc[1].values, vec![1; 10]);
    }

    #[test]
    fn reserved_mode_is_rejected() {
        let mut w = PayloadWriter::new();
        w.bit(true).bit(true).write(3, 6).write(7, 0);
        let bytes = w.into_bytes();

        let mut reader = PayloadReader::new(&bytes);
        match read_ps_data(&mut reader, None) {
            Err(Error::InvalidPs(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_ipd_extension() {
        let mut w = PayloadWriter::new();
        w.bit(true)
            .bit(true)
            .write(3, 0)
            .bit(false)
            .bit(true);
        // Variable borders, one envelope ending at slot 32.
        w.bit(true).write(2, 0).write(5, 31);
        w.bit(false);
        for _ in 0..10 {
            w.code(&IID_DEF_DF, 0);
        }
        // Extension id 0: enable flag, one IPD and one OPD set, reserved bit.
        let ext_bits = 2
            + 1
            + (1 + 5 * IPD_DF.codes[2].1 as usize)
            + (1 + 5 * OPD_DF.codes[0].1 as usize)
            + 1;
        let cnt = (ext_bits + 7) / 8;
        w.write(4, cnt as u32);
        w.write(2, 0).bit(true).bit(false);
        for _ in 0..5 {
            w.code(&IPD_DF, 2);
        }
        w.bit(false);
        for _ in 0..5 {
            w.code(&OPD_DF, 0);
        }
        w.bit(false);
        w.write((cnt * 8 - ext_bits) as u32, 0);
        let bits = w.bits();
        let bytes = w.into_bytes();

        let mut reader = PayloadReader::new(&bytes);
        let frame = read_ps_data(&mut reader, None).unwrap().frame.unwrap();
        assert_eq!(reader.position(), bits);
        assert_eq!(frame.borders[1], 32);
        assert!(frame.enable_ipdopd);
        assert_eq!(frame.ipd[0].values, vec![2; 5]);
        assert_eq!(frame.opd[0].values, vec![0; 5]);
    }
}
