//! The address-space capability shared by `Workspace` and `Emulator`.
//!
//! Unlike the dense, fixed-capacity page map used elsewhere for read-only
//! static analysis, this address space is a sparse set of named, page-aligned
//! regions — mirroring the region bookkeeping a CPU emulator itself performs,
//! since one of the two implementations (`Emulator`) is backed directly by
//! one.

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use failure::{Error, Fail};
use log::debug;

use crate::arch::{Mode, RVA, VA};

pub const PAGE_SIZE: u64 = 0x1000;

pub fn round_up_to_page(length: u64) -> u64 {
    if length % PAGE_SIZE == 0 {
        length
    } else {
        length + (PAGE_SIZE - (length % PAGE_SIZE))
    }
}

#[derive(Debug, Fail)]
pub enum AddressSpaceError {
    #[fail(display = "address range 0x{:x}+0x{:x} overlaps an existing region", _0, _1)]
    AlreadyMapped(u64, u64),
    #[fail(display = "no mapped region exactly matches 0x{:x}+0x{:x}", _0, _1)]
    InvalidArgument(u64, u64),
    #[fail(display = "address 0x{:x} is not mapped", _0)]
    UnmappedMemory(u64),
}

/// A single contiguous, page-aligned, named region of an address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub address: VA,
    pub length: u64,
    pub name: String,
}

impl MemoryRegion {
    pub fn end(&self) -> VA {
        self.address + self.length
    }

    pub fn contains(&self, va: VA) -> bool {
        va >= self.address && va < self.end()
    }
}

/// Capability implemented by both `Workspace` and `Emulator`: the unified
/// read/write/map surface that the rest of the crate is written against.
pub trait AddressSpace {
    fn mode(&self) -> Mode;

    fn mem_map(&mut self, va: VA, length: u64, name: &str) -> Result<(), Error>;
    fn mem_unmap(&mut self, va: VA, length: u64) -> Result<(), Error>;
    fn mem_read(&self, va: VA, length: u64) -> Result<Vec<u8>, Error>;
    fn mem_write(&mut self, va: VA, data: &[u8]) -> Result<(), Error>;
    fn get_maps(&self) -> Vec<MemoryRegion>;

    /// Read a pointer-sized (4 or 8 byte, per `self.mode()`) little-endian value.
    fn mem_read_ptr(&self, va: VA) -> Result<VA, Error> {
        match self.mode() {
            Mode::M32 => {
                let buf = self.mem_read(va, 4)?;
                Ok(VA(u64::from(LittleEndian::read_u32(&buf))))
            }
            Mode::M64 => {
                let buf = self.mem_read(va, 8)?;
                Ok(VA(LittleEndian::read_u64(&buf)))
            }
        }
    }

    /// RVAs are always 32 bits on disk, regardless of mode.
    fn mem_read_rva(&self, va: VA) -> Result<RVA, Error> {
        let buf = self.mem_read(va, 4)?;
        Ok(RVA::from(LittleEndian::read_u32(&buf)))
    }

    fn mem_read_u16(&self, va: VA) -> Result<u16, Error> {
        let buf = self.mem_read(va, 2)?;
        Ok(LittleEndian::read_u16(&buf))
    }
}

/// A plain, in-process implementation of `AddressSpace` backed by a
/// `BTreeMap` of region-start to byte buffer. Used directly by `Workspace`;
/// `Emulator` implements the trait itself against the CPU engine's own
/// memory, but uses the same region-overlap/exact-unmap rules.
pub struct RegionAddressSpace {
    mode: Mode,
    regions: BTreeMap<u64, MemoryRegion>,
    buffers: BTreeMap<u64, Vec<u8>>,
}

impl RegionAddressSpace {
    pub fn new(mode: Mode) -> RegionAddressSpace {
        RegionAddressSpace {
            mode,
            regions: BTreeMap::new(),
            buffers: BTreeMap::new(),
        }
    }

    /// Find the region (if any) containing `va`.
    fn region_at(&self, va: VA) -> Option<&MemoryRegion> {
        self.regions
            .range(..=va.0)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(va))
    }

    fn overlaps(&self, va: VA, length: u64) -> bool {
        let end = va.0 + length;
        self.regions
            .values()
            .any(|r| va.0 < r.end().0 && end > r.address.0)
    }
}

impl AddressSpace for RegionAddressSpace {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn mem_map(&mut self, va: VA, length: u64, name: &str) -> Result<(), Error> {
        let length = round_up_to_page(length);
        if self.overlaps(va, length) {
            return Err(AddressSpaceError::AlreadyMapped(va.0, length).into());
        }
        debug!("mem_map: {} +0x{:x} {}", va, length, name);
        self.regions.insert(
            va.0,
            MemoryRegion {
                address: va,
                length,
                name: name.to_string(),
            },
        );
        self.buffers.insert(va.0, vec![0u8; length as usize]);
        Ok(())
    }

    fn mem_unmap(&mut self, va: VA, length: u64) -> Result<(), Error> {
        match self.regions.get(&va.0) {
            Some(r) if r.length == length => {}
            _ => return Err(AddressSpaceError::InvalidArgument(va.0, length).into()),
        }
        self.regions.remove(&va.0);
        self.buffers.remove(&va.0);
        Ok(())
    }

    fn mem_read(&self, va: VA, length: u64) -> Result<Vec<u8>, Error> {
        let region = self
            .region_at(va)
            .ok_or_else(|| AddressSpaceError::UnmappedMemory(va.0))?;
        let end = VA(va.0 + length);
        if end > region.end() {
            return Err(AddressSpaceError::UnmappedMemory(region.end().0).into());
        }
        let buf = &self.buffers[&region.address.0];
        let start = (va.0 - region.address.0) as usize;
        Ok(buf[start..start + length as usize].to_vec())
    }

    fn mem_write(&mut self, va: VA, data: &[u8]) -> Result<(), Error> {
        let region = self
            .region_at(va)
            .ok_or_else(|| AddressSpaceError::UnmappedMemory(va.0))?
            .clone();
        let end = VA(va.0 + data.len() as u64);
        if end > region.end() {
            return Err(AddressSpaceError::UnmappedMemory(region.end().0).into());
        }
        let buf = self.buffers.get_mut(&region.address.0).unwrap();
        let start = (va.0 - region.address.0) as usize;
        buf[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn get_maps(&self) -> Vec<MemoryRegion> {
        self.regions.values().cloned().collect()
    }
}

/// Mirror every region (and its contents) from `src` into `dst`. Used to
/// spin up a fresh `Emulator`'s memory from a `Workspace`.
pub fn copy_address_space(dst: &mut dyn AddressSpace, src: &dyn AddressSpace) -> Result<(), Error> {
    for region in src.get_maps() {
        dst.mem_map(region.address, region.length, &region.name)?;
        let data = src.mem_read(region.address, region.length)?;
        dst.mem_write(region.address, &data)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_read_write_roundtrip() {
        let mut space = RegionAddressSpace::new(Mode::M32);
        space.mem_map(VA(0x1000), 0x1000, "test").unwrap();
        space.mem_write(VA(0x1000), b"hello").unwrap();
        assert_eq!(space.mem_read(VA(0x1000), 5).unwrap(), b"hello");
    }

    #[test]
    fn overlapping_map_fails() {
        let mut space = RegionAddressSpace::new(Mode::M32);
        space.mem_map(VA(0x1000), 0x1000, "a").unwrap();
        assert!(space.mem_map(VA(0x1000), 0x1000, "b").is_err());
        assert!(space.mem_map(VA(0x1800), 0x1000, "b").is_err());
    }

    #[test]
    fn unmap_requires_exact_bounds() {
        let mut space = RegionAddressSpace::new(Mode::M32);
        space.mem_map(VA(0x1000), 0x2000, "a").unwrap();
        assert!(space.mem_unmap(VA(0x1000), 0x1000).is_err());
        assert!(space.mem_unmap(VA(0x1000), 0x2000).is_ok());
        assert!(space.get_maps().is_empty());
    }

    #[test]
    fn read_outside_region_fails() {
        let mut space = RegionAddressSpace::new(Mode::M32);
        space.mem_map(VA(0x1000), 0x1000, "a").unwrap();
        assert!(space.mem_read(VA(0xDEAD), 4).is_err());
    }

    #[test]
    fn length_rounds_up_to_page() {
        let mut space = RegionAddressSpace::new(Mode::M32);
        space.mem_map(VA(0x1000), 0x1, "a").unwrap();
        assert_eq!(space.get_maps()[0].length, PAGE_SIZE);
    }

    #[test]
    fn get_maps_reflects_unmap_precisely() {
        let mut space = RegionAddressSpace::new(Mode::M32);
        space.mem_map(VA(0x1000), 0x1000, "a").unwrap();
        space.mem_map(VA(0x3000), 0x1000, "b").unwrap();
        space.mem_unmap(VA(0x1000), 0x1000).unwrap();
        let maps = space.get_maps();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].address, VA(0x3000));
    }

    #[test]
    fn copy_mirrors_regions_and_contents() {
        let mut src = RegionAddressSpace::new(Mode::M32);
        src.mem_map(VA(0x1000), 0x1000, "a").unwrap();
        src.mem_write(VA(0x1000), b"abc").unwrap();

        let mut dst = RegionAddressSpace::new(Mode::M32);
        copy_address_space(&mut dst, &src).unwrap();

        assert_eq!(dst.mem_read(VA(0x1000), 3).unwrap(), b"abc");
    }
}
