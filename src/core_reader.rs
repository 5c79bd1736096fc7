use crate::{*, error::*, elf::*};
use memmap2::Mmap;
use std::fs::File;

// Read side of the pipeline: the input core, mapped read-only. Program headers
// are parsed up front; segment data is sliced out of the mapping on demand,
// always bounds-checked against the mapped length.
pub struct CoreReader {
    pub name: String,
    pub class: ElfClass,
    pub header: Ehdr,
    pub phdrs: Vec<Phdr>,

    // (p_vaddr, p_vaddr + p_filesz, index in phdrs) for PT_LOAD segments,
    // sorted by start. Kernel cores come pre-sorted, but we don't rely on it.
    load_index: Vec<(u64, u64, usize)>,

    mmap: Mmap,
}

impl CoreReader {
    pub fn open(path: &str) -> Result<CoreReader> {
        let file = File::open(path)?;
        let mmap = unsafe {Mmap::map(&file)}?;
        let (class, header) = open_elf_header(&mmap, path)?;

        let mut phdrs: Vec<Phdr> = Vec::new();
        for idx in 0..header.e_phnum as usize {
            let p = class.read_phdr(&mmap, header.e_phoff as usize + idx * header.e_phentsize as usize)?;
            if p.p_offset.saturating_add(p.p_filesz) > mmap.len() as u64 {
                eprintln!("warning: segment {} of {} extends past end of file (offset 0x{:x}, filesz 0x{:x}, file len 0x{:x})", idx, path, p.p_offset, p.p_filesz, mmap.len());
            }
            phdrs.push(p);
        }

        let mut load_index: Vec<(u64, u64, usize)> = phdrs.iter().enumerate()
            .filter(|(_, p)| p.p_type == PT_LOAD && p.p_filesz > 0)
            .map(|(i, p)| (p.p_vaddr, p.p_vaddr + p.p_filesz, i))
            .collect();
        load_index.sort_unstable();

        Ok(CoreReader {name: path.to_string(), class, header, phdrs, load_index, mmap})
    }

    pub fn data(&self) -> &[u8] {
        &self.mmap
    }

    // First PT_LOAD whose file image covers `va`.
    pub fn segment_by_address(&self, va: u64) -> Option<&Phdr> {
        let idx = self.load_index.partition_point(|&(_, end, _)| end <= va);
        match self.load_index.get(idx) {
            Some(&(start, _, phdr_idx)) if start <= va => Some(&self.phdrs[phdr_idx]),
            _ => None,
        }
    }

    pub fn segment_by_type(&self, t: u32) -> Option<&Phdr> {
        self.phdrs.iter().find(|p| p.p_type == t)
    }

    pub fn segment_by_index(&self, idx: usize) -> Option<&Phdr> {
        self.phdrs.get(idx)
    }

    pub fn data_at_offset(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let file_len = self.mmap.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > file_len) {
            return err!(MalformedElf, "out of bounds read in {}: offset 0x{:x} + 0x{:x} > 0x{:x}", self.name, offset, len, file_len);
        }
        Ok(&self.mmap[offset as usize..(offset + len) as usize])
    }

    pub fn segment_data(&self, ph: &Phdr) -> Result<&[u8]> {
        self.data_at_offset(ph.p_offset, ph.p_filesz)
    }

    // `len` bytes at virtual address `va`, if some PT_LOAD's file image has them.
    pub fn data_at_address(&self, va: u64, len: u64) -> Option<&[u8]> {
        let seg = self.segment_by_address(va)?;
        if va + len > seg.p_vaddr + seg.p_filesz {
            return None;
        }
        self.data_at_offset(seg.p_offset + (va - seg.p_vaddr), len).ok()
    }

    // NUL-terminated string at `va`, not crossing the containing segment.
    pub fn cstr_at_address(&self, va: u64) -> Option<&[u8]> {
        let seg = self.segment_by_address(va)?;
        let avail = seg.p_vaddr + seg.p_filesz - va;
        let data = self.data_at_offset(seg.p_offset + (va - seg.p_vaddr), avail).ok()?;
        let nul = data.iter().position(|&c| c == 0)?;
        Some(&data[..nul])
    }
}
