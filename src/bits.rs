use crate::data::HuffmanTree;
use crate::Error;

use bitstream_io::{BigEndian, BitReader, Numeric};

/// Bit reader over one extension payload, bounded by its byte count.
///
/// Every read is checked against the boundary so that a malformed payload is
/// reported as an overrun instead of silently consuming the next element.
pub(crate) struct PayloadReader<'a> {
    bit_reader: BitReader<&'a [u8], BigEndian>,
    position: usize,
    len: usize,
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(payload: &'a [u8]) -> PayloadReader<'a> {
        PayloadReader {
            bit_reader: BitReader::new(payload),
            position: 0,
            len: payload.len() * 8,
        }
    }

    fn consume(&mut self, bits: usize) -> Result<(), Error> {
        if self.position + bits > self.len {
            return Err(Error::PayloadOverrun {
                read: self.position + bits,
                available: self.len,
            });
        }
        self.position += bits;

        Ok(())
    }

    pub(crate) fn read<U: Numeric>(&mut self, bits: u32) -> Result<U, Error> {
        self.consume(bits as usize)?;
        Ok(self.bit_reader.read::<U>(bits)?)
    }

    pub(crate) fn read_bit(&mut self) -> Result<bool, Error> {
        self.consume(1)?;
        Ok(self.bit_reader.read_bit()?)
    }

    pub(crate) fn skip(&mut self, bits: usize) -> Result<(), Error> {
        self.consume(bits)?;
        Ok(self.bit_reader.skip(bits as u32)?)
    }

    /// Reads one code word, returning the decoded value.
    pub(crate) fn read_huffman(&mut self, tree: &HuffmanTree) -> Result<i32, Error> {
        let symbol = self.bit_reader.read_huffman(tree)?;
        self.consume(symbol.len as usize)?;

        Ok(symbol.value as i32)
    }

    pub(crate) fn position(&self) -> usize {
        self.position
    }

    pub(crate) fn bits_left(&self) -> usize {
        self.len - self.position
    }

    /// Consumes the fill bits up to the payload boundary.
    pub(crate) fn finish(&mut self) -> Result<(), Error> {
        let left = self.bits_left();
        self.skip(left)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::*;

    use bitstream_io::{BitWriter, BigEndian};

    /// Builds payloads bit by bit, the way an encoder would.
    pub(crate) struct PayloadWriter {
        writer: BitWriter<Vec<u8>, BigEndian>,
        bits: usize,
    }

    impl PayloadWriter {
        pub(crate) fn new() -> PayloadWriter {
            PayloadWriter {
                writer: BitWriter::new(Vec::new()),
                bits: 0,
            }
        }

        pub(crate) fn write(&mut self, bits: u32, value: u32) -> &mut Self {
            self.writer.write(bits, value).unwrap();
            self.bits += bits as usize;
            self
        }

        pub(crate) fn bit(&mut self, value: bool) -> &mut Self {
            self.write(1, value as u32)
        }

        /// Writes the code word of `value` from a code book.
        pub(crate) fn code(&mut self, book: &HuffmanCodes, value: i32) -> &mut Self {
            let (code, len) = book.codes[(value - book.min_value as i32) as usize];
            self.write(len as u32, code)
        }

        pub(crate) fn bits(&self) -> usize {
            self.bits
        }

        pub(crate) fn into_bytes(mut self) -> Vec<u8> {
            self.writer.byte_align().unwrap();
            self.writer.into_writer()
        }
    }

    #[test]
    fn counts_consumed_bits() {
        let mut w = PayloadWriter::new();
        w.write(4, 13).bit(true).code(&ENV_3_0DB_F, -3).write(3, 5);
        let bits = w.bits();
        let bytes = w.into_bytes();

        let mut reader = PayloadReader::new(&bytes);
        assert_eq!(reader.read::<u8>(4).unwrap(), 13);
        assert!(reader.read_bit().unwrap());
        assert_eq!(reader.read_huffman(&F_HUFF_ENV_3_0DB).unwrap(), -3);
        assert_eq!(reader.read::<u8>(3).unwrap(), 5);
        assert_eq!(reader.position(), bits);

        reader.finish().unwrap();
        assert_eq!(reader.bits_left(), 0);
    }

    #[test]
    fn overrun_is_reported() {
        let bytes = [0xFFu8];
        let mut reader = PayloadReader::new(&bytes);
        reader.read::<u8>(6).unwrap();

        match reader.read::<u8>(3) {
            Err(Error::PayloadOverrun { read, available }) => {
                assert_eq!(read, 9);
                assert_eq!(available, 8);
            }
            other => panic!("expected overrun, got {:?}", other),
        }
    }

    #[test]
    fn every_code_book_decodes() {
        let books: [(&HuffmanCodes, &HuffmanTree); 20] = [
            (&ENV_1_5DB_F, &F_HUFF_ENV_1_5DB),
            (&ENV_1_5DB_T, &T_HUFF_ENV_1_5DB),
            (&ENV_BAL_1_5DB_F, &F_HUFF_ENV_BAL_1_5DB),
            (&ENV_BAL_1_5DB_T, &T_HUFF_ENV_BAL_1_5DB),
            (&ENV_3_0DB_F, &F_HUFF_ENV_3_0DB),
            (&ENV_3_0DB_T, &T_HUFF_ENV_3_0DB),
            (&ENV_BAL_3_0DB_F, &F_HUFF_ENV_BAL_3_0DB),
            (&ENV_BAL_3_0DB_T, &T_HUFF_ENV_BAL_3_0DB),
            (&NOISE_3_0DB_T, &T_HUFF_NOISE_3_0DB),
            (&NOISE_BAL_3_0DB_T, &T_HUFF_NOISE_BAL_3_0DB),
            (&IID_DEF_DF, &F_HUFF_IID_DEF),
            (&IID_DEF_DT, &T_HUFF_IID_DEF),
            (&IID_FINE_DF, &F_HUFF_IID_FINE),
            (&IID_FINE_DT, &T_HUFF_IID_FINE),
            (&ICC_DF, &F_HUFF_ICC),
            (&ICC_DT, &T_HUFF_ICC),
            (&IPD_DF, &F_HUFF_IPD),
            (&IPD_DT, &T_HUFF_IPD),
            (&OPD_DF, &F_HUFF_OPD),
            (&OPD_DT, &T_HUFF_OPD),
        ];

        for (book, tree) in books.iter() {
            let mut w = PayloadWriter::new();
            let values: Vec<i32> = (0..book.codes.len())
                .map(|i| i as i32 + book.min_value as i32)
                .collect();
            for &value in &values {
                w.code(book, value);
            }
            let bits = w.bits();
            let bytes = w.into_bytes();

            let mut reader = PayloadReader::new(&bytes);
            for &value in &values {
                assert_eq!(reader.read_huffman(tree).unwrap(), value);
            }
            assert_eq!(reader.position(), bits);
        }
    }
}
