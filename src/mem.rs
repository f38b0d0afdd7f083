use crate::{error::Error, Address};
use std::collections::HashMap;

/// Flat byte-addressed backing store.
///
/// Holds both the instruction image and global data. Unwritten addresses
/// read as zero. All accesses must be naturally aligned for their width.
#[derive(Debug, Default, Clone)]
pub struct MainMemory {
    bytes: HashMap<Address, u8>,
}

fn check_alignment(addr: Address, size: u32) -> Result<(), Error> {
    if addr % size == 0 {
        Ok(())
    } else {
        Err(Error::AlignmentFault { addr, size })
    }
}

impl MainMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn read_u8(&self, addr: Address) -> u8 {
        self.bytes.get(&addr).copied().unwrap_or(0)
    }

    pub fn write_u8(&mut self, addr: Address, value: u8) {
        if value == 0 {
            // the map is sparse, a zero byte is indistinguishable from
            // an unwritten one
            self.bytes.remove(&addr);
        } else {
            self.bytes.insert(addr, value);
        }
    }

    pub fn read_u16(&self, addr: Address) -> Result<u16, Error> {
        check_alignment(addr, 2)?;
        Ok(u16::from_le_bytes([self.read_u8(addr), self.read_u8(addr + 1)]))
    }

    pub fn write_u16(&mut self, addr: Address, value: u16) -> Result<(), Error> {
        check_alignment(addr, 2)?;
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(addr + i as Address, byte);
        }
        Ok(())
    }

    pub fn read_u32(&self, addr: Address) -> Result<u32, Error> {
        check_alignment(addr, 4)?;
        Ok(u32::from_le_bytes([
            self.read_u8(addr),
            self.read_u8(addr + 1),
            self.read_u8(addr + 2),
            self.read_u8(addr + 3),
        ]))
    }

    pub fn write_u32(&mut self, addr: Address, value: u32) -> Result<(), Error> {
        check_alignment(addr, 4)?;
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(addr + i as Address, byte);
        }
        Ok(())
    }

    /// Aligned 32-bit instruction fetch.
    pub fn fetch_instruction(&self, pc: Address) -> Result<u32, Error> {
        self.read_u32(pc)
    }

    /// Copy a whole cache line out of the store. `base` must be aligned
    /// to the line size.
    pub fn read_line(&self, base: Address, line: &mut [u8]) {
        debug_assert_eq!(base as usize % line.len(), 0);
        for (i, byte) in line.iter_mut().enumerate() {
            *byte = self.read_u8(base + i as Address);
        }
    }

    /// Write a whole cache line back into the store.
    pub fn write_line(&mut self, base: Address, line: &[u8]) {
        debug_assert_eq!(base as usize % line.len(), 0);
        for (i, byte) in line.iter().enumerate() {
            self.write_u8(base + i as Address, *byte);
        }
    }

    /// Load a contiguous segment, used by the program loader.
    pub fn load_segment(&mut self, base: Address, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.write_u8(base + i as Address, *byte);
        }
    }
}
