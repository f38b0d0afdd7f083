use crate::Address;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;

/// Errors from the program loaders, separate from the simulation fault
/// taxonomy because they happen before a driver exists.
#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("binary image length {0} is not a multiple of 4")]
    Truncated(usize),
}

/// One `.data` or `.shared` segment: raw bytes at a base address
/// (shared segments use window-relative offsets).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub base: Address,
    pub bytes: Vec<u8>,
}

/// The loader output format the simulator consumes.
///
/// Instructions are little-endian 32-bit words placed contiguously at
/// `base`; execution starts at `base`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramImage {
    #[serde(default)]
    pub base: Address,
    pub instructions: Vec<u32>,
    #[serde(default)]
    pub data: Vec<Segment>,
    #[serde(default)]
    pub shared: Vec<Segment>,
}

impl ProgramImage {
    /// Wrap an already-assembled word list.
    #[must_use]
    pub fn from_words(base: Address, instructions: Vec<u32>) -> Self {
        Self { base, instructions, ..Self::default() }
    }

    /// Load a flat binary of little-endian instruction words.
    pub fn read_binary(path: impl AsRef<Path>, base: Address) -> Result<Self, LoadError> {
        let bytes = std::fs::read(path)?;
        if bytes.len() % 4 != 0 {
            return Err(LoadError::Truncated(bytes.len()));
        }
        let instructions = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Ok(Self::from_words(base, instructions))
    }

    /// Load the structured JSON image emitted by the assembler.
    pub fn from_json(reader: impl Read) -> Result<Self, LoadError> {
        Ok(serde_json::from_reader(reader)?)
    }

    #[must_use]
    pub fn entry_pc(&self) -> Address {
        self.base
    }

    /// First address past the instruction image.
    #[must_use]
    pub fn end_pc(&self) -> Address {
        self.base + self.instructions.len() as Address * 4
    }
}

#[cfg(test)]
mod tests {
    use super::ProgramImage;

    #[test]
    fn json_image_round_trips() {
        let json = r#"{
            "base": 64,
            "instructions": [1, 2, 3],
            "data": [{ "base": 4096, "bytes": [1, 0, 0, 0] }],
            "shared": [{ "base": 0, "bytes": [9] }]
        }"#;
        let image = ProgramImage::from_json(json.as_bytes()).unwrap();
        assert_eq!(image.base, 64);
        assert_eq!(image.instructions, vec![1, 2, 3]);
        assert_eq!(image.data[0].base, 4096);
        assert_eq!(image.entry_pc(), 64);
        assert_eq!(image.end_pc(), 76);
    }

    #[test]
    fn binary_image_is_little_endian() {
        let dir = std::env::temp_dir().join("warpsim-program-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("image.bin");
        std::fs::write(&path, [0x78, 0x56, 0x34, 0x12, 0xff, 0x00, 0x00, 0x00]).unwrap();
        let image = ProgramImage::read_binary(&path, 0).unwrap();
        assert_eq!(image.instructions, vec![0x1234_5678, 0xff]);
    }

    #[test]
    fn ragged_binary_is_rejected() {
        let dir = std::env::temp_dir().join("warpsim-program-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ragged.bin");
        std::fs::write(&path, [1, 2, 3]).unwrap();
        assert!(matches!(
            ProgramImage::read_binary(&path, 0),
            Err(super::LoadError::Truncated(3))
        ));
    }
}
