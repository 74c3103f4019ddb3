use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bytecode::op::{DecodeError, Op, decode_all};

/// A compiled program: opcodes and operands intermixed as one flat sequence
/// of numeric cells, loaded at address 0 of the machine's memory.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProgramImage {
    pub cells: Vec<f64>,
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image codec error: {0}")]
    Codec(#[from] postcard::Error),

    #[error("image contains invalid code: {0}")]
    Decode(#[from] DecodeError),
}

impl ProgramImage {
    pub fn new(cells: Vec<f64>) -> Self {
        Self { cells }
    }

    pub fn from_ops(ops: &[Op]) -> Self {
        Self::new(crate::bytecode::op::encode_all(ops))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Decoded instructions with their cell addresses.
    pub fn instructions(&self) -> Result<Vec<(usize, Op)>, ImageError> {
        Ok(decode_all(&self.cells)?)
    }

    /// Persisted form: a length prefix followed by every cell.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ImageError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Load a persisted image and check that it decodes cleanly.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ImageError> {
        let image: ProgramImage = postcard::from_bytes(bytes)?;
        decode_all(&image.cells)?;
        Ok(image)
    }
}
