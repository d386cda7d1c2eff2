// AAC SBR/PS Decoder
//
// Copyright (c) 2020 Cory Forsstrom <cforsstrom18@gmail.com>
// Copyright (c) 2003-2005 M. Bakker, Nero AG
//
// The following code is a derivative work of the code from the FAAD2 project,
// which is licensed GPL v2. This code therefore is also licensed under the terms
// of the GNU General Public License, version 2 or later.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Payload exhausted: {0}")]
    IOError(io::Error),
    #[error("Payload overrun: read {read} bits of {available}")]
    PayloadOverrun { read: usize, available: usize },
    #[error("Unsupported extension payload type: {0}")]
    UnsupportedExtension(u8),
    #[error("No SBR header received yet")]
    NoHeader,
    #[error("Invalid frame grid: {0}")]
    InvalidGrid(&'static str),
    #[error("Frequency table derivation failed: {0}")]
    InvalidTables(String),
    #[error("Invalid parametric stereo data: {0}")]
    InvalidPs(&'static str),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Expected {expected} channel buffers, got {got}")]
    ChannelMismatch { expected: usize, got: usize },
    #[error("{0}")]
    Other(&'static str),
    #[error("{0}")]
    OtherFormat(String),
}

impl Error {
    /// Stable numeric code, usable by callers that report errors as integers.
    pub fn code(&self) -> u8 {
        match self {
            Error::IOError(_) => 1,
            Error::PayloadOverrun { .. } => 2,
            Error::UnsupportedExtension(_) => 3,
            Error::NoHeader => 4,
            Error::InvalidGrid(_) => 5,
            Error::InvalidTables(_) => 6,
            Error::InvalidPs(_) => 7,
            Error::InvalidConfig(_) => 8,
            Error::ChannelMismatch { .. } => 9,
            Error::Other(_) | Error::OtherFormat(_) => 255,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IOError(error)
    }
}
