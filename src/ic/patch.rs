// The patch region models the executable memory inline cache sites are reserved in. Writers
// link a whole stub or rewrite one structure id under the write lock and then bump the
// version with release ordering; readers copy bytes under the read lock, so no reader can see
// half of a stub. The version lets a thread that cached a view of the region notice that a
// site was relinked since.

//! Atomic publication of inline cache stubs.

use super::generator::InlineStub;
use super::site::StubSite;
use parking_lot::RwLock;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("range {start:#x}..{end:#x} outside the patch region")]
    OutOfRange { start: u64, end: u64 },
    #[error("stub is {actual} bytes but the site reserves {reserved}")]
    SizeMismatch { reserved: usize, actual: usize },
    #[error("stub has no structure check to repatch")]
    NoStructureCheck,
}

pub struct PatchRegion {
    base: u64,
    bytes: RwLock<Vec<u8>>,
    version: AtomicU64,
}

impl PatchRegion {
    /// A region of `size` bytes at `base`, filled with `int3`.
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            bytes: RwLock::new(vec![0xcc; size]),
            version: AtomicU64::new(0),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn range(&self, start: u64, len: usize) -> Result<Range<usize>, PatchError> {
        let size = self.bytes.read().len();
        let end = start.saturating_add(len as u64);
        match self.base.checked_add(size as u64) {
            Some(limit) if start >= self.base && end <= limit => {}
            _ => return Err(PatchError::OutOfRange { start, end }),
        }
        let offset = (start - self.base) as usize;
        Ok(offset..offset + len)
    }

    /// Replace the reserved bytes of `site` with `stub`.
    pub fn link(&self, site: &StubSite, stub: &InlineStub) -> Result<(), PatchError> {
        if stub.len() != site.inline_size {
            return Err(PatchError::SizeMismatch {
                reserved: site.inline_size,
                actual: stub.len(),
            });
        }
        let range = self.range(site.start, stub.len())?;
        self.bytes.write()[range].copy_from_slice(&stub.code);
        self.version.fetch_add(1, Ordering::Release);
        log::debug!("linked {} at {:#x}", stub.name, site.start);
        Ok(())
    }

    /// Point an already linked stub at a different structure.
    pub fn repatch_structure(
        &self,
        site: &StubSite,
        stub: &InlineStub,
        structure: u32,
    ) -> Result<(), PatchError> {
        let immediate = stub.structure_immediate.ok_or(PatchError::NoStructureCheck)?;
        let range = self.range(site.start + immediate as u64, 4)?;
        self.bytes.write()[range].copy_from_slice(&structure.to_le_bytes());
        self.version.fetch_add(1, Ordering::Release);
        Ok(())
    }

    pub fn read(&self, start: u64, len: usize) -> Result<Vec<u8>, PatchError> {
        let range = self.range(start, len)?;
        Ok(self.bytes.read()[range].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register_file::AsmReg;
    use crate::ic::generator::generate_self_property_access;
    use crate::ic::layout::{PropertyOffset, StructureId};
    use crate::ic::site::AccessType;
    use std::sync::Arc;
    use std::thread;

    fn site() -> StubSite {
        let mut site = StubSite::new(AccessType::GetById, AsmReg::RDI, AsmReg::RAX);
        site.start = 0x2010;
        site.inline_size = 24;
        site.slow_path_start = 0x2800;
        site
    }

    #[test]
    fn test_region_at_top_of_address_space() {
        let region = PatchRegion::new(u64::MAX - 0x10, 0x100);
        assert!(matches!(
            region.read(u64::MAX - 8, 4),
            Err(PatchError::OutOfRange { .. })
        ));
        assert!(region.read(0x2000, 4).is_err());
    }

    #[test]
    fn test_link_and_repatch() {
        let region = PatchRegion::new(0x2000, 0x100);
        let site = site();
        let stub = generate_self_property_access(&site, StructureId(9), PropertyOffset(0)).unwrap();

        region.link(&site, &stub).unwrap();
        assert_eq!(region.version(), 1);
        assert_eq!(region.read(site.start, stub.len()).unwrap(), stub.code);
        assert_eq!(region.read(0x2000, 1).unwrap(), vec![0xcc]);

        region.repatch_structure(&site, &stub, 0xabcd).unwrap();
        let imm = site.start + stub.structure_immediate.unwrap() as u64;
        assert_eq!(region.read(imm, 4).unwrap(), 0xabcdu32.to_le_bytes().to_vec());
        assert_eq!(region.version(), 2);
    }

    #[test]
    fn test_link_rejects_bad_ranges() {
        let region = PatchRegion::new(0x2000, 0x20);
        let mut site = site();
        let stub = generate_self_property_access(&site, StructureId(1), PropertyOffset(0)).unwrap();
        site.start = 0x2010;
        site.inline_size = 24;
        assert!(matches!(region.link(&site, &stub), Err(PatchError::OutOfRange { .. })));

        site.inline_size = 16;
        assert!(matches!(region.link(&site, &stub), Err(PatchError::SizeMismatch { .. })));
        assert_eq!(region.version(), 0);
    }

    #[test]
    fn test_readers_never_see_partial_stubs() {
        let region = Arc::new(PatchRegion::new(0x2000, 0x100));
        let site = site();
        let first = generate_self_property_access(&site, StructureId(1), PropertyOffset(0)).unwrap();
        let second = generate_self_property_access(&site, StructureId(2), PropertyOffset(5)).unwrap();
        region.link(&site, &first).unwrap();

        let reader = {
            let region = Arc::clone(&region);
            let (start, a, b) = (site.start, first.code.clone(), second.code.clone());
            thread::spawn(move || {
                for _ in 0..1000 {
                    let seen = region.read(start, a.len()).unwrap();
                    assert!(seen == a || seen == b);
                }
            })
        };
        for i in 0..1000 {
            let stub = if i % 2 == 0 { &second } else { &first };
            region.link(&site, stub).unwrap();
        }
        reader.join().unwrap();
        assert_eq!(region.version(), 1001);
    }
}
