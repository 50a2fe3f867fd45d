use crate::{
    address_space::{
        memory_range::MemoryRange,
        memory_region::{Backing, MemoryRegion, Prot},
    },
    error::{CheckpointError, Result},
    log::LogLevel::LogWarn,
    remote_ptr::RemotePtr,
};
use libc::{ino_t, pid_t};
use memchr::memchr_iter;
use nix::sys::stat::makedev;
use std::fs;

/// Iterates over one consistent read of /proc/<pid>/maps.
///
/// The whole table is read in one go so that concurrent mmap/munmap in the
/// subject cannot tear a line.
pub struct KernelMapIterator {
    contents: Vec<u8>,
    line_ends: std::vec::IntoIter<usize>,
    pos: usize,
}

impl Iterator for KernelMapIterator {
    type Item = MemoryRegion;

    fn next(&mut self) -> Option<MemoryRegion> {
        loop {
            let end = self.line_ends.next()?;
            let raw = &self.contents[self.pos..end];
            self.pos = end + 1;
            let raw_line = String::from_utf8_lossy(raw);
            match Self::parse_rawline(&raw_line) {
                Some(region) if region.size() > 0 => return Some(region),
                Some(_) => continue,
                None => {
                    log!(LogWarn, "Skipping unparseable maps line `{}'", raw_line);
                    continue;
                }
            }
        }
    }
}

impl KernelMapIterator {
    pub fn new_from_pid(pid: pid_t) -> Result<KernelMapIterator> {
        let maps_path = format!("/proc/{}/maps", pid);
        let contents = fs::read(&maps_path).map_err(|e| {
            log!(LogWarn, "Failed to read {}: {}", maps_path, e);
            CheckpointError::MapsUnreadable(pid)
        })?;
        Ok(Self::from_contents(contents))
    }

    pub fn from_contents(mut contents: Vec<u8>) -> KernelMapIterator {
        if contents.last().map_or(false, |&c| c != b'\n') {
            contents.push(b'\n');
        }
        let line_ends: Vec<usize> = memchr_iter(b'\n', &contents).collect();
        KernelMapIterator {
            contents,
            line_ends: line_ends.into_iter(),
            pos: 0,
        }
    }

    fn parse_rawline(raw_line: &str) -> Option<MemoryRegion> {
        let mut iter = raw_line.splitn(6, ' ');
        let addr_range = iter.next()?;
        let perms_s = iter.next()?;
        let offset_s = iter.next()?;
        let device = iter.next()?;
        let inode_s = iter.next()?;
        // Anonymous mappings have no name at all, not even the padding.
        let name_escaped = iter.next().unwrap_or("").trim_start_matches(' ');

        let mut addr_iter = addr_range.split('-');
        let addr_low_s = addr_iter.next()?;
        let addr_high_s = addr_iter.next()?;

        let mut dev_iter = device.split(':');
        let dev_major_s = dev_iter.next()?;
        let dev_minor_s = dev_iter.next()?;

        let addr_low: RemotePtr = usize::from_str_radix(addr_low_s, 16).ok()?.into();
        let addr_high: RemotePtr = usize::from_str_radix(addr_high_s, 16).ok()?.into();
        if addr_high < addr_low {
            return None;
        }
        let offset: u64 = u64::from_str_radix(offset_s, 16).ok()?;
        let dev_major = u64::from_str_radix(dev_major_s, 16).ok()?;
        let dev_minor = u64::from_str_radix(dev_minor_s, 16).ok()?;
        let inode: ino_t = inode_s.parse::<ino_t>().ok()?;

        let name = unescape_name(name_escaped);
        let backing = if name.is_empty() {
            Backing::Anonymous
        } else if name.starts_with('[') {
            Backing::Named(name)
        } else {
            Backing::File {
                path: name,
                offset,
                device: makedev(dev_major, dev_minor),
                inode,
            }
        };

        Some(MemoryRegion::new(
            MemoryRange::from_range(addr_low, addr_high),
            Prot::from_perms(perms_s),
            perms_s.as_bytes().get(3) == Some(&b's'),
            backing,
        ))
    }
}

/// The kernel writes a newline in a file name as `\012`.
fn unescape_name(escaped: &str) -> String {
    let mut filename = String::with_capacity(escaped.len());
    let mut rest = escaped;
    while let Some(loc) = rest.find("\\012") {
        filename.push_str(&rest[..loc]);
        filename.push('\n');
        rest = &rest[loc + 4..];
    }
    filename.push_str(rest);
    filename
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::address_space::memory_region::RegionKind;

    const MAPS: &str = "\
55d0c8a00000-55d0c8a02000 r--p 00000000 08:03 1835101                    /usr/bin/cat
55d0c8a02000-55d0c8a03000 rw-p 00002000 08:03 1835101                    /usr/bin/cat
55d0c8a03000-55d0c8a04000 rw-p 00000000 00:00 0
55d0c9000000-55d0c9021000 rw-p 00000000 00:00 0                          [heap]
7f1c00000000-7f1c00000000 rw-p 00000000 00:00 0
7f1c00001000-7f1c00002000 rw-s 00000000 00:05 77                         /memfd:buf (deleted)
7f1c00002000-7f1c00003000 r--p 00000000 08:03 99                         /tmp/odd\\012name
7ffd5e9a0000-7ffd5e9c1000 rw-p 00000000 00:00 0                          [stack]
7ffd5e9fc000-7ffd5ea00000 r--p 00000000 00:00 0                          [vvar]
7ffd5ea00000-7ffd5ea02000 r-xp 00000000 00:00 0                          [vdso]";

    #[test]
    fn parses_a_maps_table() {
        let mut regions: Vec<MemoryRegion> =
            KernelMapIterator::from_contents(MAPS.as_bytes().to_vec()).collect();
        MemoryRegion::classify(&mut regions);
        // The zero sized line is dropped.
        assert_eq!(regions.len(), 9);

        assert_eq!(regions[0].kind(), RegionKind::FileMapping);
        assert_eq!(regions[1].kind(), RegionKind::Data);
        assert_eq!(regions[2].kind(), RegionKind::Bss);
        assert_eq!(regions[3].kind(), RegionKind::Heap);
        assert_eq!(regions[3].size(), 0x21000);

        assert!(regions[4].is_shared());
        assert_eq!(regions[4].fsname(), "/memfd:buf (deleted)");
        assert_eq!(regions[5].fsname(), "/tmp/odd\nname");
        assert_eq!(regions[6].kind(), RegionKind::Stack);
        assert_eq!(regions[7].kind(), RegionKind::Special);
        assert!(!regions[8].has_contents());

        match regions[1].backing() {
            Backing::File { offset, inode, .. } => {
                assert_eq!(*offset, 0x2000);
                assert_eq!(*inode, 1835101);
            }
            b => panic!("unexpected backing {:?}", b),
        }
    }

    #[test]
    fn skips_garbage() {
        let regions: Vec<MemoryRegion> =
            KernelMapIterator::from_contents(b"garbage\n1000-2000 rw-p 0 00:00 0".to_vec()).collect();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].backing(), &Backing::Anonymous);
    }

    #[test]
    fn reads_own_maps() {
        let regions: Vec<MemoryRegion> = KernelMapIterator::new_from_pid(std::process::id() as pid_t)
            .unwrap()
            .collect();
        assert!(!regions.is_empty());
        for w in regions.windows(2) {
            assert!(w[0].end() <= w[1].start());
        }
    }

    #[test]
    fn unescapes() {
        assert_eq!(unescape_name("a\\012b\\012"), "a\nb\n");
        assert_eq!(unescape_name("plain"), "plain");
        assert_eq!(unescape_name("a\\01"), "a\\01");
    }
}
