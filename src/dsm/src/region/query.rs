// Copyright 2026 The DSM Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{Region, RegionError};
use crate::{AccessLevel, PageIndex};

/// Answers "which access does this node currently have to a page".
pub trait ProtectionQuery {
    /// Current local access level of `page`.
    fn protection(&self, page: PageIndex) -> Result<AccessLevel, RegionError>;
}

/// Bookkeeping kept by the region itself. This is what the fault handler reads.
impl ProtectionQuery for Region {
    fn protection(&self, page: PageIndex) -> Result<AccessLevel, RegionError> {
        self.access_level(page)
    }
}

/// Asks the kernel through `/proc/self/maps`.
#[derive(Debug)]
pub struct ProcMaps<'a> {
    region: &'a Region,
}

impl<'a> ProcMaps<'a> {
    /// Creates a query for pages of `region`.
    pub fn new(region: &'a Region) -> Self {
        ProcMaps { region }
    }

    fn lookup(maps: &str, addr: usize) -> Result<Option<AccessLevel>, RegionError> {
        for line in maps.lines() {
            let mut fields = line.split_whitespace();
            let (Some(range), Some(perms)) = (fields.next(), fields.next()) else {
                return Err(RegionError::MapsFormat(line.to_string()));
            };
            let (start, end) = range
                .split_once('-')
                .and_then(|(start, end)| {
                    Some((
                        usize::from_str_radix(start, 16).ok()?,
                        usize::from_str_radix(end, 16).ok()?,
                    ))
                })
                .ok_or_else(|| RegionError::MapsFormat(line.to_string()))?;
            if addr < start || addr >= end {
                continue;
            }
            let perms = perms.as_bytes();
            let level = match (perms.first(), perms.get(1)) {
                (Some(b'r'), Some(b'w')) => AccessLevel::ReadWrite,
                (Some(b'r'), _) => AccessLevel::Read,
                _ => AccessLevel::None,
            };
            return Ok(Some(level));
        }
        Ok(None)
    }
}

impl ProtectionQuery for ProcMaps<'_> {
    fn protection(&self, page: PageIndex) -> Result<AccessLevel, RegionError> {
        let addr = self.region.page_addr(page)?;
        let maps = std::fs::read_to_string("/proc/self/maps").map_err(RegionError::Maps)?;
        Self::lookup(&maps, addr)?.ok_or(RegionError::OutOfRegion(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_maps() {
        let maps = "\
00400000-00452000 r-xp 00000000 08:02 173521      /usr/bin/dbus-daemon
7f0000000000-7f0000001000 ---p 00000000 00:00 0
7f0000001000-7f0000002000 rw-p 00000000 00:00 0
7f0000002000-7f0000003000 r--p 00000000 00:00 0";

        assert_eq!(
            ProcMaps::lookup(maps, 0x7f00_0000_0800).unwrap(),
            Some(AccessLevel::None)
        );
        assert_eq!(
            ProcMaps::lookup(maps, 0x7f00_0000_1000).unwrap(),
            Some(AccessLevel::ReadWrite)
        );
        assert_eq!(
            ProcMaps::lookup(maps, 0x7f00_0000_2fff).unwrap(),
            Some(AccessLevel::Read)
        );
        assert_eq!(ProcMaps::lookup(maps, 0x10).unwrap(), None);
        assert!(matches!(
            ProcMaps::lookup("garbage", 0x10),
            Err(RegionError::MapsFormat(_))
        ));
    }

    #[test]
    fn test_kernel_agrees_with_bookkeeping() {
        let region = Region::reserve(3).unwrap();
        region.grant(1, AccessLevel::Read).unwrap();
        region.grant(2, AccessLevel::ReadWrite).unwrap();

        let kernel = ProcMaps::new(&region);
        for page in 0..3 {
            assert_eq!(
                kernel.protection(page).unwrap(),
                region.protection(page).unwrap()
            );
        }
    }
}
