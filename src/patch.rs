//! Sinks for the byte writes a relocation produces.

use serde::{Deserialize, Serialize};

use crate::{Address, Error, Region};

/// A run of bytes to place at an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRecord {
    pub address: Address,
    pub bytes: Vec<u8>,
}

/// Receives patch writes in the order they are produced.
pub trait PatchWriter {
    fn write(&mut self, address: Address, bytes: &[u8]) -> Result<(), Error>;
}

impl PatchWriter for Vec<WriteRecord> {
    fn write(&mut self, address: Address, bytes: &[u8]) -> Result<(), Error> {
        self.push(WriteRecord { address, bytes: bytes.to_vec() });
        Ok(())
    }
}

/// An owned, writable copy of a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionImage {
    base: Address,
    data: Vec<u8>,
}

impl RegionImage {
    pub fn new(base: Address, data: Vec<u8>) -> Self {
        Self { base, data }
    }

    pub fn from_region(region: Region<'_>) -> Self {
        Self::new(region.base(), region.data().to_vec())
    }

    pub fn region(&self) -> Region<'_> {
        Region::new(self.base, &self.data)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl PatchWriter for RegionImage {
    fn write(&mut self, address: Address, bytes: &[u8]) -> Result<(), Error> {
        let start = address.checked_sub(self.base).map(usize::from).ok_or(Error::OutOfRegion(address))?;
        let end = start + bytes.len();
        if end > self.data.len() {
            let last = u32::from(address) + bytes.len() as u32 - 1;
            return Err(Error::OutOfRegion(last.min(0xffff) as Address));
        }
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }
}
