use super::memory_range::MemoryRange;
use crate::remote_ptr::RemotePtr;
use libc::{dev_t, ino_t};
use nix::sys::{
    mman::{MapFlags, ProtFlags},
    stat::{major, minor},
};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result},
    ops::Deref,
};

bitflags! {
    #[derive(Serialize, Deserialize)]
    pub struct Prot: u8 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

impl Prot {
    pub fn from_perms(perms_s: &str) -> Prot {
        let mut prot = Prot::empty();
        let b = perms_s.as_bytes();
        if b.get(0) == Some(&b'r') {
            prot |= Prot::READ;
        }
        if b.get(1) == Some(&b'w') {
            prot |= Prot::WRITE;
        }
        if b.get(2) == Some(&b'x') {
            prot |= Prot::EXEC;
        }
        prot
    }

    pub fn to_prot_flags(self) -> ProtFlags {
        let mut flags = ProtFlags::PROT_NONE;
        if self.contains(Prot::READ) {
            flags |= ProtFlags::PROT_READ;
        }
        if self.contains(Prot::WRITE) {
            flags |= ProtFlags::PROT_WRITE;
        }
        if self.contains(Prot::EXEC) {
            flags |= ProtFlags::PROT_EXEC;
        }
        flags
    }

    pub fn prot_string(self) -> String {
        let mut s = String::with_capacity(3);
        s.push(if self.contains(Prot::READ) { 'r' } else { '-' });
        s.push(if self.contains(Prot::WRITE) { 'w' } else { '-' });
        s.push(if self.contains(Prot::EXEC) { 'x' } else { '-' });
        s
    }
}

/// What sits behind a region.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Backing {
    Anonymous,
    File {
        /// As the kernel prints it, including a ` (deleted)` suffix.
        path: String,
        offset: u64,
        device: dev_t,
        inode: ino_t,
    },
    /// A bracketed kernel name such as `[heap]`, `[stack]` or `[vdso]`.
    Named(String),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RegionKind {
    Heap,
    Stack,
    /// Writable part of a mapped file, typically .data
    Data,
    /// Anonymous mapping directly following the data part of the same object
    Bss,
    FileMapping,
    /// [vdso], [vvar], [vsyscall] and friends. Never captured or restored.
    Special,
    Other,
}

impl Display for RegionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let s = match self {
            RegionKind::Heap => "heap",
            RegionKind::Stack => "stack",
            RegionKind::Data => "data",
            RegionKind::Bss => "bss",
            RegionKind::FileMapping => "file",
            RegionKind::Special => "special",
            RegionKind::Other => "other",
        };
        write!(f, "{}", s)
    }
}

const SPECIAL_NAMES: [&str; 4] = ["[vdso]", "[vvar]", "[vvar_vclock]", "[vsyscall]"];

/// One line of /proc/<pid>/maps, classified.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemoryRegion {
    mr: MemoryRange,
    prot: Prot,
    shared: bool,
    backing: Backing,
    kind: RegionKind,
}

impl MemoryRegion {
    /// The kind is provisional until `classify()` has seen the neighbours.
    pub fn new(mr: MemoryRange, prot: Prot, shared: bool, backing: Backing) -> MemoryRegion {
        let kind = match &backing {
            Backing::Anonymous => RegionKind::Other,
            Backing::File { .. } if prot.contains(Prot::WRITE) && !shared => RegionKind::Data,
            Backing::File { .. } => RegionKind::FileMapping,
            Backing::Named(name) if name == "[heap]" => RegionKind::Heap,
            Backing::Named(name) if name.starts_with("[stack") => RegionKind::Stack,
            Backing::Named(name) if SPECIAL_NAMES.contains(&name.as_str()) => RegionKind::Special,
            Backing::Named(_) => RegionKind::Other,
        };
        MemoryRegion {
            mr,
            prot,
            shared,
            backing,
            kind,
        }
    }

    /// Refine kinds that depend on the previous region. `regions` must be in
    /// address order.
    pub fn classify(regions: &mut [MemoryRegion]) {
        for i in 1..regions.len() {
            let (before, rest) = regions.split_at_mut(i);
            let prev = &before[i - 1];
            let cur = &mut rest[0];
            if cur.backing == Backing::Anonymous
                && prev.kind == RegionKind::Data
                && prev.end() == cur.start()
                && cur.prot.contains(Prot::WRITE)
            {
                cur.kind = RegionKind::Bss;
            }
        }
    }

    pub fn range(&self) -> MemoryRange {
        self.mr
    }
    pub fn prot(&self) -> Prot {
        self.prot
    }
    pub fn is_shared(&self) -> bool {
        self.shared
    }
    pub fn backing(&self) -> &Backing {
        &self.backing
    }
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn map_flags(&self) -> MapFlags {
        if self.shared {
            MapFlags::MAP_SHARED
        } else {
            MapFlags::MAP_PRIVATE
        }
    }

    pub fn is_readable(&self) -> bool {
        self.prot.contains(Prot::READ)
    }
    pub fn is_writable(&self) -> bool {
        self.prot.contains(Prot::WRITE)
    }
    pub fn is_file_backed(&self) -> bool {
        matches!(self.backing, Backing::File { .. })
    }

    /// Whether the page contents go into a savestate. Read-only file
    /// mappings can be reconstructed from the file and special kernel
    /// regions cannot be written at all, so those are layout only.
    pub fn has_contents(&self) -> bool {
        self.is_readable()
            && self.kind != RegionKind::Special
            && (self.is_writable() || !self.is_file_backed())
    }

    pub fn fsname(&self) -> &str {
        match &self.backing {
            Backing::Anonymous => "",
            Backing::File { path, .. } => path,
            Backing::Named(name) => name,
        }
    }

    /// Same region restricted to [start, end). File offsets move with it.
    pub fn subrange(&self, start: RemotePtr, end: RemotePtr) -> MemoryRegion {
        debug_assert!(start >= self.start() && end <= self.end());
        let backing = match &self.backing {
            Backing::File {
                path,
                offset,
                device,
                inode,
            } => Backing::File {
                path: path.clone(),
                offset: offset + (start - self.start()) as u64,
                device: *device,
                inode: *inode,
            },
            b => b.clone(),
        };
        MemoryRegion {
            mr: MemoryRange::from_range(start, end),
            prot: self.prot,
            shared: self.shared,
            backing,
            kind: self.kind,
        }
    }

    /// Same address, size, protection and backing.
    pub fn same_layout(&self, other: &MemoryRegion) -> bool {
        self.mr == other.mr
            && self.prot == other.prot
            && self.shared == other.shared
            && self.backing == other.backing
    }

    /// Dump a representation of |self| to a string in a format
    /// similar to /proc/[tid]/maps.
    pub fn str(&self) -> String {
        let (offset, device, inode) = match self.backing {
            Backing::File {
                offset,
                device,
                inode,
                ..
            } => (offset, device, inode),
            _ => (0, 0, 0),
        };
        let s = format!(
            "{:8x}-{:8x} {}{} {:08x} {:02x}:{:02x} {:<10} ",
            self.start().as_usize(),
            self.end().as_usize(),
            self.prot.prot_string(),
            if self.shared { 's' } else { 'p' },
            offset,
            major(device),
            minor(device),
            inode
        );
        s + self.fsname()
    }
}

impl Deref for MemoryRegion {
    type Target = MemoryRange;
    fn deref(&self) -> &Self::Target {
        &self.mr
    }
}

impl Display for MemoryRegion {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.str())
    }
}
