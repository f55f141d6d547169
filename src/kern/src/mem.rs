//! Per-environment address spaces.
//!
//! Frames are shared buffers so `map_page` aliases memory the way a page
//! table shares physical pages: an IPC page grant and the source mapping see
//! the same bytes. All access goes through the kernel lock, which is why the
//! per-frame mutex is uncontended in practice.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::error::Errno;

/// Page size of an address space.
pub const PGSIZE: usize = 4096;

/// Wire transfer granularity. A page crosses the network as four chunks;
/// nothing here may assume the two sizes are equal.
pub const CHUNK: usize = 1024;

bitflags! {
    /// Page permission bits as they appear in page requests on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Perm: u32 {
        const P     = 0x001;
        const W     = 0x002;
        const U     = 0x004;
        /// Software-available bits; `COW` lives inside this range.
        const AVAIL = 0xe00;
        const COW   = 0x800;
    }
}

impl Perm {
    /// Bits a user request may carry.
    pub const SYSCALL: Perm = Perm::P.union(Perm::W).union(Perm::U).union(Perm::AVAIL);

    /// Valid for `page_alloc`/`page_map`: P and U present, nothing outside
    /// the syscall mask.
    pub fn user_ok(self) -> bool {
        self.contains(Perm::P | Perm::U) && Perm::SYSCALL.contains(self)
    }
}

/// One shared page frame.
#[derive(Clone)]
pub struct Frame(Arc<Mutex<[u8; PGSIZE]>>);

impl Frame {
    pub fn zeroed() -> Frame {
        Frame(Arc::new(Mutex::new([0u8; PGSIZE])))
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let page = self.0.lock();
        buf.copy_from_slice(&page[offset..offset + buf.len()]);
    }

    pub fn write(&self, offset: usize, buf: &[u8]) {
        let mut page = self.0.lock();
        page[offset..offset + buf.len()].copy_from_slice(buf);
    }
}

#[derive(Clone)]
pub struct Mapping {
    pub frame: Frame,
    pub perm: Perm,
}

/// An environment's page mappings, keyed by page-aligned virtual address.
#[derive(Default)]
pub struct AddrSpace {
    pages: BTreeMap<u32, Mapping>,
}

impl AddrSpace {
    pub fn new() -> AddrSpace {
        AddrSpace::default()
    }

    /// Map a zero-filled frame at `va`, replacing any existing mapping.
    pub fn alloc_page(&mut self, va: u32, perm: Perm) -> Frame {
        let frame = Frame::zeroed();
        self.pages.insert(va, Mapping { frame: frame.clone(), perm });
        frame
    }

    /// Map an existing frame at `va`, replacing any existing mapping.
    pub fn map(&mut self, va: u32, frame: Frame, perm: Perm) {
        self.pages.insert(va, Mapping { frame, perm });
    }

    /// Silently succeeds when nothing is mapped, like `page_remove`.
    pub fn unmap(&mut self, va: u32) {
        self.pages.remove(&va);
    }

    pub fn lookup(&self, va: u32) -> Option<&Mapping> {
        self.pages.get(&va)
    }

    pub fn lookup_perm(&self, va: u32) -> Option<Perm> {
        self.pages.get(&va).map(|m| m.perm)
    }

    /// Mapped pages inside `range`, ascending.
    pub fn pages_in(&self, range: Range<u32>) -> impl Iterator<Item = (u32, Perm)> + '_ {
        self.pages.range(range).map(|(va, m)| (*va, m.perm))
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }

    /// Copy out of the page containing `addr`. The window must not cross a
    /// page boundary.
    pub fn read_window(&self, addr: u32, buf: &mut [u8]) -> Result<(), Errno> {
        let (va, off) = Self::window(addr, buf.len())?;
        let m = self.pages.get(&va).ok_or(Errno::Inval)?;
        m.frame.read(off, buf);
        Ok(())
    }

    /// Copy into the page containing `addr`. Kernel-mode writes ignore the
    /// mapping's write bit, matching supervisor stores with write-protect
    /// disabled.
    pub fn write_window(&self, addr: u32, buf: &[u8]) -> Result<(), Errno> {
        let (va, off) = Self::window(addr, buf.len())?;
        let m = self.pages.get(&va).ok_or(Errno::Inval)?;
        m.frame.write(off, buf);
        Ok(())
    }

    fn window(addr: u32, len: usize) -> Result<(u32, usize), Errno> {
        let va = addr & !(PGSIZE as u32 - 1);
        let off = (addr & (PGSIZE as u32 - 1)) as usize;
        if off + len > PGSIZE {
            return Err(Errno::Inval);
        }
        Ok((va, off))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_map_share_frame() {
        let mut a = AddrSpace::new();
        let mut b = AddrSpace::new();

        let frame = a.alloc_page(0x1000, Perm::P | Perm::U | Perm::W);
        b.map(0x5000, frame, Perm::P | Perm::U);

        a.write_window(0x1010, b"hello").unwrap();
        let mut got = [0u8; 5];
        b.read_window(0x5010, &mut got).unwrap();
        assert_eq!(&got, b"hello");
    }

    #[test]
    fn window_stays_on_one_page() {
        let mut a = AddrSpace::new();
        a.alloc_page(0x1000, Perm::P | Perm::U);

        let mut buf = [0u8; CHUNK];
        assert_eq!(a.read_window(0x1000 + 3 * CHUNK as u32, &mut buf), Ok(()));
        assert_eq!(
            a.read_window(0x1000 + PGSIZE as u32 - 1, &mut buf),
            Err(Errno::Inval)
        );
        assert_eq!(a.read_window(0x9000, &mut buf), Err(Errno::Inval));
    }

    #[test]
    fn unmap_is_idempotent() {
        let mut a = AddrSpace::new();
        a.alloc_page(0x1000, Perm::P | Perm::U);
        a.unmap(0x1000);
        a.unmap(0x1000);
        assert!(a.lookup(0x1000).is_none());
    }

    #[test]
    fn perm_validation() {
        assert!((Perm::P | Perm::U).user_ok());
        assert!((Perm::P | Perm::U | Perm::W | Perm::COW).user_ok());
        assert!(!(Perm::U | Perm::W).user_ok()); // missing P
        assert!(!Perm::from_bits_retain(0x1f).user_ok()); // stray bits
    }
}
