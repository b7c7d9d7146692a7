// Copyright 2026 The DSM Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Owner of the reserved shared region: alignment arithmetic, page protection and page content.

mod query;

use std::fs::File;
use std::os::fd::AsRawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

use memfd::MemfdOptions;
use vmm_sys_util::syscall::SyscallReturnCode;

pub use self::query::{ProcMaps, ProtectionQuery};
use crate::utils::{host_page_size, usize_to_u64};
use crate::{AccessLevel, PageIndex};

/// Errors associated with the shared region.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum RegionError {
    /// Cannot reserve {0} pages of shared memory: {1}
    Reserve(usize, std::io::Error),
    /// Cannot create the memory file backing the region: {0}
    Memfd(memfd::Error),
    /// Cannot change protection of page {0}: {1}
    Protect(PageIndex, std::io::Error),
    /// Address {0:#x} is outside the reserved region
    OutOfRegion(usize),
    /// Page {0} is out of range
    PageIndex(PageIndex),
    /// Page {0} has no read access on this node
    NotReadable(PageIndex),
    /// Page {0} has no write access on this node
    NotWritable(PageIndex),
    /// Access of {len} bytes at offset {offset} does not fit in a page of {page_size} bytes
    Length {
        /// Offset inside the page.
        offset: usize,
        /// Length of the access.
        len: usize,
        /// Page size of the region.
        page_size: usize,
    },
    /// Cannot read the process memory map: {0}
    Maps(std::io::Error),
    /// Malformed memory map line: {0}
    MapsFormat(String),
}

/// A reserved range of memory, split into host-sized pages whose protection is changed one page
/// at a time.
///
/// The region keeps a per-page record of the protection it last installed. That record is the
/// only thing the fault handler consults, so every protection change has to go through
/// [`Region::grant`].
///
/// The memory is mapped twice: once at [`Region::base`] with per-page protection, where the
/// application loads and stores, and once more, always writable, for the coherence engine to copy
/// page content in and out without ever opening the application mapping up.
#[derive(Debug)]
pub struct Region {
    base: NonNull<u8>,
    alias: NonNull<u8>,
    _memfd: File,
    num_pages: usize,
    page_size: usize,
    page_shift: u32,
    levels: Box<[AtomicU8]>,
}

// SAFETY: The region is a pair of plain memory mappings; all mutation of its bookkeeping is atomic and
// content is only copied in or out while the protection allows it.
unsafe impl Send for Region {}
// SAFETY: See above.
unsafe impl Sync for Region {}

impl Region {
    /// Reserves `num_pages` pages with no access rights.
    pub fn reserve(num_pages: usize) -> Result<Self, RegionError> {
        let page_size = host_page_size();
        let reserve_error = |err: std::io::Error| RegionError::Reserve(num_pages, err);
        let len = num_pages
            .checked_mul(page_size)
            .filter(|&len| len > 0)
            .ok_or_else(|| reserve_error(std::io::Error::from_raw_os_error(libc::EINVAL)))?;

        let memfd = MemfdOptions::default()
            .close_on_exec(true)
            .create("dsm-region")
            .map_err(RegionError::Memfd)?
            .into_file();
        memfd
            .set_len(usize_to_u64(len))
            .map_err(reserve_error)?;

        let base = map_shared(&memfd, len, libc::PROT_NONE).map_err(reserve_error)?;
        let alias = match map_shared(&memfd, len, libc::PROT_READ | libc::PROT_WRITE) {
            Ok(alias) => alias,
            Err(err) => {
                unmap(base, len);
                return Err(reserve_error(err));
            }
        };

        log::info!(
            "Reserved {} pages of {} bytes at {:#x}",
            num_pages,
            page_size,
            base.as_ptr() as usize
        );

        Ok(Region {
            base,
            alias,
            _memfd: memfd,
            num_pages,
            page_size,
            page_shift: page_size.trailing_zeros(),
            levels: (0..num_pages)
                .map(|_| AtomicU8::new(AccessLevel::None as u8))
                .collect(),
        })
    }

    /// Start address of the region.
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Raw pointer to the first byte of the region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        self.num_pages * self.page_size
    }

    /// Whether the region has no pages. Never true for a reserved region.
    pub fn is_empty(&self) -> bool {
        self.num_pages == 0
    }

    /// Number of pages in the region.
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Page size in bytes; equals the host page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// `log2(page_size)`.
    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    /// Whether `addr` lies inside the region.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr - self.base() < self.len()
    }

    /// Rounds `addr` down to its page boundary and maps it to a page index.
    pub fn page_index_of(&self, addr: usize) -> Result<PageIndex, RegionError> {
        if !self.contains(addr) {
            return Err(RegionError::OutOfRegion(addr));
        }
        Ok((addr - self.base()) >> self.page_shift)
    }

    /// Address of the first byte of `page`.
    pub fn page_addr(&self, page: PageIndex) -> Result<usize, RegionError> {
        self.check_page(page)?;
        Ok(self.base() + (page << self.page_shift))
    }

    /// Protection currently installed on `page`.
    pub fn access_level(&self, page: PageIndex) -> Result<AccessLevel, RegionError> {
        self.check_page(page)?;
        Ok(AccessLevel::from_raw(
            self.levels[page].load(Ordering::Acquire),
        ))
    }

    /// Sets the local access to `page`. Setting the level a page already has is a no-op.
    pub fn grant(&self, page: PageIndex, level: AccessLevel) -> Result<(), RegionError> {
        if self.access_level(page)? == level {
            return Ok(());
        }
        self.protect(page, level)
    }

    /// Copies out the content of `page`, which must be at least readable.
    pub fn read_page(&self, page: PageIndex) -> Result<Vec<u8>, RegionError> {
        let mut bytes = vec![0u8; self.page_size];
        self.read_bytes(page, 0, &mut bytes)?;
        Ok(bytes)
    }

    /// Copies out whatever content was last left in `page`, even after its access was revoked.
    ///
    /// The caller makes sure `page` is not writable while copying.
    pub fn retained_page(&self, page: PageIndex) -> Result<Vec<u8>, RegionError> {
        let src = self.alias_addr(page)?;
        let mut bytes = vec![0u8; self.page_size];
        // SAFETY: A whole page of the alias mapping, which is always readable; `bytes` is a
        // distinct allocation of the same length.
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, bytes.as_mut_ptr(), bytes.len());
        }
        Ok(bytes)
    }

    /// Copies `buf.len()` bytes at `offset` inside `page` into `buf`.
    pub fn read_bytes(
        &self,
        page: PageIndex,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), RegionError> {
        self.check_span(offset, buf.len())?;
        if self.access_level(page)? < AccessLevel::Read {
            return Err(RegionError::NotReadable(page));
        }
        let src = self.alias_addr(page)? + offset;
        // SAFETY: The span lies inside the alias mapping, which is always readable, and `buf` is
        // a distinct allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Stores `data` at `offset` inside `page`, which must be writable.
    pub fn write_bytes(
        &self,
        page: PageIndex,
        offset: usize,
        data: &[u8],
    ) -> Result<(), RegionError> {
        self.check_span(offset, data.len())?;
        if self.access_level(page)? < AccessLevel::ReadWrite {
            return Err(RegionError::NotWritable(page));
        }
        let dst = self.alias_addr(page)? + offset;
        // SAFETY: The span lies inside the alias mapping, which is always writable, and `data`
        // is a distinct allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst as *mut u8, data.len());
        }
        Ok(())
    }

    /// Installs `bytes` as the content of `page` and then sets the page to `level`.
    ///
    /// The copy goes through the alias mapping, so the page never becomes accessible to the
    /// application before it holds the new content.
    pub fn write_page(
        &self,
        page: PageIndex,
        bytes: &[u8],
        level: AccessLevel,
    ) -> Result<(), RegionError> {
        if bytes.len() != self.page_size {
            return Err(RegionError::Length {
                offset: 0,
                len: bytes.len(),
                page_size: self.page_size,
            });
        }
        let dst = self.alias_addr(page)?;
        // SAFETY: A whole page of the alias mapping, which is always writable; `bytes` is a
        // distinct allocation of the same length.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst as *mut u8, bytes.len());
        }
        self.grant(page, level)
    }

    /// Per-page protection record, indexed by page.
    pub(crate) fn levels(&self) -> &[AtomicU8] {
        &self.levels
    }

    fn protect(&self, page: PageIndex, level: AccessLevel) -> Result<(), RegionError> {
        let addr = self.page_addr(page)?;
        // SAFETY: `addr` is page aligned and the page lies inside our own mapping.
        SyscallReturnCode(unsafe {
            libc::mprotect(addr as *mut libc::c_void, self.page_size, level.prot_flags())
        })
        .into_empty_result()
        .map_err(|err| RegionError::Protect(page, err))?;
        self.levels[page].store(level as u8, Ordering::Release);
        Ok(())
    }

    fn alias_addr(&self, page: PageIndex) -> Result<usize, RegionError> {
        self.check_page(page)?;
        Ok(self.alias.as_ptr() as usize + (page << self.page_shift))
    }

    fn check_page(&self, page: PageIndex) -> Result<(), RegionError> {
        if page >= self.num_pages {
            return Err(RegionError::PageIndex(page));
        }
        Ok(())
    }

    fn check_span(&self, offset: usize, len: usize) -> Result<(), RegionError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.page_size => Ok(()),
            _ => Err(RegionError::Length {
                offset,
                len,
                page_size: self.page_size,
            }),
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unmap(self.base, self.len());
        unmap(self.alias, self.len());
    }
}

fn map_shared(memfd: &File, len: usize, prot: libc::c_int) -> Result<NonNull<u8>, std::io::Error> {
    // SAFETY: A new shared mapping of our own memfd at a kernel chosen address; no existing
    // memory is affected.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            prot,
            libc::MAP_SHARED | libc::MAP_NORESERVE,
            memfd.as_raw_fd(),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    NonNull::new(addr.cast::<u8>()).ok_or_else(|| std::io::Error::from_raw_os_error(libc::ENOMEM))
}

fn unmap(addr: NonNull<u8>, len: usize) {
    // SAFETY: The mapping was created by `map_shared` with exactly this length and nothing
    // borrows it past the lifetime of its region.
    let ret = unsafe { libc::munmap(addr.as_ptr().cast(), len) };
    if ret < 0 {
        log::error!(
            "Failed to release mapping at {:#x}: {}",
            addr.as_ptr() as usize,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve() {
        let region = Region::reserve(4).unwrap();
        assert_eq!(region.num_pages(), 4);
        assert_eq!(region.page_size(), host_page_size());
        assert_eq!(region.len(), 4 * region.page_size());
        assert_eq!(region.base() % region.page_size(), 0);
        for page in 0..4 {
            assert_eq!(region.access_level(page).unwrap(), AccessLevel::None);
        }
        assert!(matches!(
            Region::reserve(0),
            Err(RegionError::Reserve(0, _))
        ));
    }

    #[test]
    fn test_page_index_of() {
        let region = Region::reserve(3).unwrap();
        let size = region.page_size();
        let base = region.base();

        assert_eq!(region.page_index_of(base).unwrap(), 0);
        assert_eq!(region.page_index_of(base + size - 1).unwrap(), 0);
        assert_eq!(region.page_index_of(base + size).unwrap(), 1);
        assert_eq!(region.page_index_of(base + 3 * size - 1).unwrap(), 2);
        assert!(matches!(
            region.page_index_of(base + 3 * size),
            Err(RegionError::OutOfRegion(_))
        ));
        assert!(matches!(
            region.page_index_of(base - 1),
            Err(RegionError::OutOfRegion(_))
        ));
    }

    #[test]
    fn test_grant_and_access() {
        let region = Region::reserve(2).unwrap();

        assert!(matches!(
            region.read_page(0),
            Err(RegionError::NotReadable(0))
        ));

        region.grant(0, AccessLevel::ReadWrite).unwrap();
        // Granting the same level twice is fine.
        region.grant(0, AccessLevel::ReadWrite).unwrap();
        region.write_bytes(0, 8, &[1, 2, 3]).unwrap();

        region.grant(0, AccessLevel::Read).unwrap();
        assert!(matches!(
            region.write_bytes(0, 0, &[1]),
            Err(RegionError::NotWritable(0))
        ));
        let mut buf = [0u8; 3];
        region.read_bytes(0, 8, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);

        assert!(matches!(
            region.grant(2, AccessLevel::Read),
            Err(RegionError::PageIndex(2))
        ));
    }

    #[test]
    fn test_write_page_normalizes_protection() {
        let region = Region::reserve(1).unwrap();
        let content = vec![0xabu8; region.page_size()];

        region.write_page(0, &content, AccessLevel::Read).unwrap();
        assert_eq!(region.access_level(0).unwrap(), AccessLevel::Read);
        assert_eq!(region.read_page(0).unwrap(), content);

        assert!(matches!(
            region.write_page(0, &[0u8; 3], AccessLevel::Read),
            Err(RegionError::Length { len: 3, .. })
        ));
    }

    #[test]
    fn test_content_lands_behind_protection() {
        let region = Region::reserve(2).unwrap();
        let mut content = vec![0u8; region.page_size()];
        content[..4].copy_from_slice(b"dsm!");

        // Installed while inaccessible; the application mapping stays closed.
        region.write_page(1, &content, AccessLevel::None).unwrap();
        assert_eq!(
            ProcMaps::new(&region).protection(1).unwrap(),
            AccessLevel::None
        );

        region.grant(1, AccessLevel::Read).unwrap();
        let addr = region.page_addr(1).unwrap();
        // SAFETY: The page is readable and inside the region.
        let seen = unsafe { std::slice::from_raw_parts(addr as *const u8, 4) };
        assert_eq!(seen, b"dsm!");
    }

    #[test]
    fn test_content_survives_revocation() {
        let region = Region::reserve(1).unwrap();
        region.grant(0, AccessLevel::ReadWrite).unwrap();
        region.write_bytes(0, 0, b"kept").unwrap();
        region.grant(0, AccessLevel::None).unwrap();

        assert!(matches!(
            region.read_page(0),
            Err(RegionError::NotReadable(0))
        ));
        assert_eq!(&region.retained_page(0).unwrap()[..4], b"kept");
        assert!(matches!(
            region.retained_page(1),
            Err(RegionError::PageIndex(1))
        ));
    }

    #[test]
    fn test_span_checks() {
        let region = Region::reserve(1).unwrap();
        region.grant(0, AccessLevel::ReadWrite).unwrap();
        let size = region.page_size();
        region.write_bytes(0, size - 1, &[0]).unwrap();
        assert!(matches!(
            region.write_bytes(0, size - 1, &[0, 0]),
            Err(RegionError::Length { .. })
        ));
        assert!(matches!(
            region.write_bytes(0, usize::MAX, &[0]),
            Err(RegionError::Length { .. })
        ));
    }
}
