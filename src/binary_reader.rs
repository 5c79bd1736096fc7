use crate::{*, error::*, elf::*};
use memmap2::Mmap;
use std::{fs::File, cell::Cell, str};

// The crashed executable. Unlike the core, it must have section headers: the
// reducer needs .dynamic and .interp, which live only in the section table.
pub struct BinaryReader {
    pub name: String,
    pub class: ElfClass,
    pub header: Ehdr,
    pub phdrs: Vec<Phdr>,
    pub sections: Vec<Shdr>,
    pub section_names: Vec<String>,

    // Index of the last section a lookup returned. The common access pattern
    // is several queries for the same section in a row, so each lookup checks
    // the cached one before rescanning.
    cached_section: Cell<usize>,

    mmap: Mmap,
}

impl BinaryReader {
    pub fn open(path: &str) -> Result<BinaryReader> {
        let file = File::open(path)?;
        let mmap = unsafe {Mmap::map(&file)}?;
        let (class, header) = open_elf_header(&mmap, path)?;
        if header.e_type != ET_EXEC && header.e_type != ET_DYN {
            return err!(MalformedElf, "{} is not an executable (e_type = {})", path, header.e_type);
        }
        if header.e_shnum == 0 {
            return err!(MalformedElf, "{} has no section headers", path);
        }

        let mut phdrs: Vec<Phdr> = Vec::new();
        for idx in 0..header.e_phnum as usize {
            phdrs.push(class.read_phdr(&mmap, header.e_phoff as usize + idx * header.e_phentsize as usize)?);
        }
        let mut sections: Vec<Shdr> = Vec::new();
        for idx in 0..header.e_shnum as usize {
            sections.push(class.read_shdr(&mmap, header.e_shoff as usize + idx * header.e_shentsize as usize)?);
        }

        let mut section_names = vec![String::new(); sections.len()];
        if (header.e_shstrndx as usize) < sections.len() {
            let strtab = sections[header.e_shstrndx as usize];
            let strtab_end = strtab.sh_offset.saturating_add(strtab.sh_size).min(mmap.len() as u64);
            for (idx, s) in sections.iter().enumerate() {
                let name_off = strtab.sh_offset.saturating_add(s.sh_name as u64);
                if name_off < strtab_end {
                    let tail = &mmap[name_off as usize..strtab_end as usize];
                    if let Some(nul) = tail.iter().position(|&c| c == 0) {
                        section_names[idx] = String::from_utf8_lossy(&tail[..nul]).into_owned();
                    }
                }
            }
        } else {
            eprintln!("warning: bad e_shstrndx {} in {}, section names unavailable", header.e_shstrndx, path);
        }

        Ok(BinaryReader {name: path.to_string(), class, header, phdrs, sections, section_names, cached_section: Cell::new(usize::MAX), mmap})
    }

    fn find_section<F: Fn(&BinaryReader, usize) -> bool>(&self, matches: F) -> Option<usize> {
        let cached = self.cached_section.get();
        if cached < self.sections.len() && matches(self, cached) {
            return Some(cached);
        }
        for idx in 0..self.sections.len() {
            if matches(self, idx) {
                self.cached_section.set(idx);
                return Some(idx);
            }
        }
        None
    }

    pub fn section_by_name(&self, name: &str) -> Option<&Shdr> {
        self.find_section(|b, i| b.section_names[i] == name).map(|i| &self.sections[i])
    }

    pub fn section_by_type(&self, t: u32) -> Option<&Shdr> {
        self.find_section(|b, i| b.sections[i].sh_type == t).map(|i| &self.sections[i])
    }

    pub fn section_by_address(&self, va: u64) -> Option<&Shdr> {
        self.find_section(|b, i| {
            let s = &b.sections[i];
            s.sh_addr <= va && va < s.sh_addr + s.sh_size
        }).map(|i| &self.sections[i])
    }

    // Used only to locate PT_PHDR for the load bias.
    pub fn segment_by_type(&self, t: u32) -> Option<&Phdr> {
        self.phdrs.iter().find(|p| p.p_type == t)
    }

    pub fn section_data(&self, s: &Shdr) -> Result<&[u8]> {
        if s.sh_type == SHT_NOBITS {
            return Ok(&[]);
        }
        bytes_at(&self.mmap, s.sh_offset as usize, s.sh_size as usize)
    }

    // Path of the dynamic linker, from .interp. None means statically linked.
    pub fn interp(&self) -> Option<(u64, String)> {
        let s = *self.section_by_name(".interp")?;
        let data = self.section_data(&s).ok()?;
        let len = data.iter().position(|&c| c == 0).unwrap_or(data.len());
        Some((s.sh_addr, str::from_utf8(&data[..len]).ok()?.to_string()))
    }
}
