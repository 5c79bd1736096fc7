use crate::{*, error::*};
use std::fmt;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_NOTE: u32 = 4;
pub const PT_PHDR: u32 = 6;

// Segment permissions.
pub const PF_X: u32 = 0x1;
pub const PF_W: u32 = 0x2;
pub const PF_R: u32 = 0x4;

pub const SHT_PROGBITS: u32 = 0x1;
pub const SHT_STRTAB: u32 = 0x3;
pub const SHT_DYNAMIC: u32 = 0x6;
pub const SHT_NOBITS: u32 = 0x8;

// These are used in core dumps.
pub const NT_PRSTATUS: u32 = 1;
pub const NT_PRFPREG: u32 = 2;
pub const NT_PRPSINFO: u32 = 3;
pub const NT_AUXV: u32 = 6;

pub const DT_NULL: i64 = 0;
pub const DT_DEBUG: i64 = 21;

pub const AT_NULL: u64 = 0;
pub const AT_PHDR: u64 = 3;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const ET_CORE: u16 = 4;

pub const EM_386: u16 = 3;
pub const EM_ARM: u16 = 40;
pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

// Class-independent views of the ELF records we touch. Fields are wide enough
// for either class; ElfClass does the (de)serialization at ABI width.
#[derive(Clone, Copy, Default, Debug)]
pub struct Ehdr {
    pub ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[derive(Clone, Copy, Default, Debug)]
pub struct Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

#[derive(Clone, Copy, Default, Debug)]
pub struct Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

#[derive(Clone, Copy, Default, Debug)]
pub struct Dyn {
    pub d_tag: i64,
    pub d_val: u64,
}

// Address width, detected from e_ident at open time. All record layouts hang
// off this so the rest of the code is written once against u64 addresses.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

impl fmt::Display for ElfClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", match self { ElfClass::Elf32 => "ELF32", ElfClass::Elf64 => "ELF64" })
    }
}

pub fn bytes_at<'a>(data: &'a [u8], offset: usize, len: usize) -> Result<&'a [u8]> {
    match offset.checked_add(len).and_then(|end| data.get(offset..end)) {
        Some(s) => Ok(s),
        None => err!(MalformedElf, "read out of bounds: {} + {} > {}", offset, len, data.len()),
    }
}

fn u16_at(data: &[u8], offset: usize) -> u16 { u16::from_le_bytes(data[offset..offset+2].try_into().unwrap()) }
fn u32_at(data: &[u8], offset: usize) -> u32 { u32::from_le_bytes(data[offset..offset+4].try_into().unwrap()) }
fn u64_at(data: &[u8], offset: usize) -> u64 { u64::from_le_bytes(data[offset..offset+8].try_into().unwrap()) }

impl ElfClass {
    pub fn from_ident(ident: &[u8]) -> Result<ElfClass> {
        match ident.get(4).copied() {
            Some(1) => Ok(ElfClass::Elf32),
            Some(2) => Ok(ElfClass::Elf64),
            Some(x) => err!(MalformedElf, "invalid EI_CLASS: {}", x),
            None => err!(MalformedElf, "truncated e_ident"),
        }
    }

    pub fn addr_size(self) -> usize { match self { ElfClass::Elf32 => 4, ElfClass::Elf64 => 8 } }
    pub fn ehdr_size(self) -> usize { match self { ElfClass::Elf32 => 52, ElfClass::Elf64 => 64 } }
    pub fn phdr_size(self) -> usize { match self { ElfClass::Elf32 => 32, ElfClass::Elf64 => 56 } }
    pub fn shdr_size(self) -> usize { match self { ElfClass::Elf32 => 40, ElfClass::Elf64 => 64 } }
    pub fn dyn_size(self) -> usize { self.addr_size() * 2 }
    pub fn auxv_size(self) -> usize { self.addr_size() * 2 }

    // struct r_debug and struct link_map as laid out by glibc's dynamic linker.
    // The link map record is 5 pointers: l_addr, l_name, l_ld, l_next, l_prev.
    pub fn r_debug_size(self) -> usize { match self { ElfClass::Elf32 => 20, ElfClass::Elf64 => 40 } }
    pub fn link_map_size(self) -> usize { self.addr_size() * 5 }
    // Offset of l_name within a link map record, and of r_map within r_debug.
    pub fn lm_name_offset(self) -> usize { self.addr_size() }
    pub fn r_debug_map_offset(self) -> usize { self.addr_size() }

    // Byte offsets of the consumed fields inside the note descriptors
    // (struct elf_prstatus / elf_prpsinfo, see linux/elfcore.h).
    pub fn prstatus_pid_offset(self) -> usize { match self { ElfClass::Elf32 => 24, ElfClass::Elf64 => 32 } }
    pub fn prstatus_reg_offset(self) -> usize { match self { ElfClass::Elf32 => 72, ElfClass::Elf64 => 112 } }
    pub fn prpsinfo_psargs_offset(self) -> usize { match self { ElfClass::Elf32 => 44, ElfClass::Elf64 => 56 } }
    pub const PRPSINFO_PSARGS_LEN: usize = 80;

    pub fn read_addr(self, data: &[u8], offset: usize) -> Result<u64> {
        let s = bytes_at(data, offset, self.addr_size())?;
        Ok(match self { ElfClass::Elf32 => u32_at(s, 0) as u64, ElfClass::Elf64 => u64_at(s, 0) })
    }

    // The caller has already sized the destination; out of bounds would be a bug.
    pub fn write_addr_at(self, buf: &mut [u8], offset: usize, value: u64) {
        match self {
            ElfClass::Elf32 => buf[offset..offset+4].copy_from_slice(&(value as u32).to_le_bytes()),
            ElfClass::Elf64 => buf[offset..offset+8].copy_from_slice(&value.to_le_bytes()),
        }
    }

    pub fn append_addr(self, out: &mut Vec<u8>, value: u64) {
        match self {
            ElfClass::Elf32 => out.extend_from_slice(&(value as u32).to_le_bytes()),
            ElfClass::Elf64 => out.extend_from_slice(&value.to_le_bytes()),
        }
    }

    pub fn read_ehdr(self, data: &[u8]) -> Result<Ehdr> {
        let s = bytes_at(data, 0, self.ehdr_size())?;
        let mut h = Ehdr::default();
        h.ident.copy_from_slice(&s[..16]);
        h.e_type = u16_at(s, 16);
        h.e_machine = u16_at(s, 18);
        h.e_version = u32_at(s, 20);
        match self {
            ElfClass::Elf32 => {
                h.e_entry = u32_at(s, 24) as u64;
                h.e_phoff = u32_at(s, 28) as u64;
                h.e_shoff = u32_at(s, 32) as u64;
                h.e_flags = u32_at(s, 36);
                h.e_ehsize = u16_at(s, 40);
                h.e_phentsize = u16_at(s, 42);
                h.e_phnum = u16_at(s, 44);
                h.e_shentsize = u16_at(s, 46);
                h.e_shnum = u16_at(s, 48);
                h.e_shstrndx = u16_at(s, 50);
            }
            ElfClass::Elf64 => {
                h.e_entry = u64_at(s, 24);
                h.e_phoff = u64_at(s, 32);
                h.e_shoff = u64_at(s, 40);
                h.e_flags = u32_at(s, 48);
                h.e_ehsize = u16_at(s, 52);
                h.e_phentsize = u16_at(s, 54);
                h.e_phnum = u16_at(s, 56);
                h.e_shentsize = u16_at(s, 58);
                h.e_shnum = u16_at(s, 60);
                h.e_shstrndx = u16_at(s, 62);
            }
        }
        Ok(h)
    }

    pub fn write_ehdr(self, buf: &mut [u8], h: &Ehdr) {
        buf[..16].copy_from_slice(&h.ident);
        buf[16..18].copy_from_slice(&h.e_type.to_le_bytes());
        buf[18..20].copy_from_slice(&h.e_machine.to_le_bytes());
        buf[20..24].copy_from_slice(&h.e_version.to_le_bytes());
        match self {
            ElfClass::Elf32 => {
                buf[24..28].copy_from_slice(&(h.e_entry as u32).to_le_bytes());
                buf[28..32].copy_from_slice(&(h.e_phoff as u32).to_le_bytes());
                buf[32..36].copy_from_slice(&(h.e_shoff as u32).to_le_bytes());
                buf[36..40].copy_from_slice(&h.e_flags.to_le_bytes());
                buf[40..42].copy_from_slice(&h.e_ehsize.to_le_bytes());
                buf[42..44].copy_from_slice(&h.e_phentsize.to_le_bytes());
                buf[44..46].copy_from_slice(&h.e_phnum.to_le_bytes());
                buf[46..48].copy_from_slice(&h.e_shentsize.to_le_bytes());
                buf[48..50].copy_from_slice(&h.e_shnum.to_le_bytes());
                buf[50..52].copy_from_slice(&h.e_shstrndx.to_le_bytes());
            }
            ElfClass::Elf64 => {
                buf[24..32].copy_from_slice(&h.e_entry.to_le_bytes());
                buf[32..40].copy_from_slice(&h.e_phoff.to_le_bytes());
                buf[40..48].copy_from_slice(&h.e_shoff.to_le_bytes());
                buf[48..52].copy_from_slice(&h.e_flags.to_le_bytes());
                buf[52..54].copy_from_slice(&h.e_ehsize.to_le_bytes());
                buf[54..56].copy_from_slice(&h.e_phentsize.to_le_bytes());
                buf[56..58].copy_from_slice(&h.e_phnum.to_le_bytes());
                buf[58..60].copy_from_slice(&h.e_shentsize.to_le_bytes());
                buf[60..62].copy_from_slice(&h.e_shnum.to_le_bytes());
                buf[62..64].copy_from_slice(&h.e_shstrndx.to_le_bytes());
            }
        }
    }

    pub fn read_phdr(self, data: &[u8], offset: usize) -> Result<Phdr> {
        let s = bytes_at(data, offset, self.phdr_size())?;
        let mut p = Phdr::default();
        p.p_type = u32_at(s, 0);
        match self {
            // Elf32_Phdr has p_flags after p_memsz; Elf64_Phdr moved it up front.
            ElfClass::Elf32 => {
                p.p_offset = u32_at(s, 4) as u64;
                p.p_vaddr = u32_at(s, 8) as u64;
                p.p_paddr = u32_at(s, 12) as u64;
                p.p_filesz = u32_at(s, 16) as u64;
                p.p_memsz = u32_at(s, 20) as u64;
                p.p_flags = u32_at(s, 24);
                p.p_align = u32_at(s, 28) as u64;
            }
            ElfClass::Elf64 => {
                p.p_flags = u32_at(s, 4);
                p.p_offset = u64_at(s, 8);
                p.p_vaddr = u64_at(s, 16);
                p.p_paddr = u64_at(s, 24);
                p.p_filesz = u64_at(s, 32);
                p.p_memsz = u64_at(s, 40);
                p.p_align = u64_at(s, 48);
            }
        }
        Ok(p)
    }

    pub fn write_phdr(self, buf: &mut [u8], p: &Phdr) {
        buf[..4].copy_from_slice(&p.p_type.to_le_bytes());
        match self {
            ElfClass::Elf32 => {
                buf[4..8].copy_from_slice(&(p.p_offset as u32).to_le_bytes());
                buf[8..12].copy_from_slice(&(p.p_vaddr as u32).to_le_bytes());
                buf[12..16].copy_from_slice(&(p.p_paddr as u32).to_le_bytes());
                buf[16..20].copy_from_slice(&(p.p_filesz as u32).to_le_bytes());
                buf[20..24].copy_from_slice(&(p.p_memsz as u32).to_le_bytes());
                buf[24..28].copy_from_slice(&p.p_flags.to_le_bytes());
                buf[28..32].copy_from_slice(&(p.p_align as u32).to_le_bytes());
            }
            ElfClass::Elf64 => {
                buf[4..8].copy_from_slice(&p.p_flags.to_le_bytes());
                buf[8..16].copy_from_slice(&p.p_offset.to_le_bytes());
                buf[16..24].copy_from_slice(&p.p_vaddr.to_le_bytes());
                buf[24..32].copy_from_slice(&p.p_paddr.to_le_bytes());
                buf[32..40].copy_from_slice(&p.p_filesz.to_le_bytes());
                buf[40..48].copy_from_slice(&p.p_memsz.to_le_bytes());
                buf[48..56].copy_from_slice(&p.p_align.to_le_bytes());
            }
        }
    }

    pub fn read_shdr(self, data: &[u8], offset: usize) -> Result<Shdr> {
        let s = bytes_at(data, offset, self.shdr_size())?;
        let mut h = Shdr::default();
        h.sh_name = u32_at(s, 0);
        h.sh_type = u32_at(s, 4);
        match self {
            ElfClass::Elf32 => {
                h.sh_flags = u32_at(s, 8) as u64;
                h.sh_addr = u32_at(s, 12) as u64;
                h.sh_offset = u32_at(s, 16) as u64;
                h.sh_size = u32_at(s, 20) as u64;
                h.sh_link = u32_at(s, 24);
                h.sh_info = u32_at(s, 28);
                h.sh_addralign = u32_at(s, 32) as u64;
                h.sh_entsize = u32_at(s, 36) as u64;
            }
            ElfClass::Elf64 => {
                h.sh_flags = u64_at(s, 8);
                h.sh_addr = u64_at(s, 16);
                h.sh_offset = u64_at(s, 24);
                h.sh_size = u64_at(s, 32);
                h.sh_link = u32_at(s, 40);
                h.sh_info = u32_at(s, 44);
                h.sh_addralign = u64_at(s, 48);
                h.sh_entsize = u64_at(s, 56);
            }
        }
        Ok(h)
    }

    pub fn write_shdr(self, buf: &mut [u8], h: &Shdr) {
        buf[..4].copy_from_slice(&h.sh_name.to_le_bytes());
        buf[4..8].copy_from_slice(&h.sh_type.to_le_bytes());
        match self {
            ElfClass::Elf32 => {
                buf[8..12].copy_from_slice(&(h.sh_flags as u32).to_le_bytes());
                buf[12..16].copy_from_slice(&(h.sh_addr as u32).to_le_bytes());
                buf[16..20].copy_from_slice(&(h.sh_offset as u32).to_le_bytes());
                buf[20..24].copy_from_slice(&(h.sh_size as u32).to_le_bytes());
                buf[24..28].copy_from_slice(&h.sh_link.to_le_bytes());
                buf[28..32].copy_from_slice(&h.sh_info.to_le_bytes());
                buf[32..36].copy_from_slice(&(h.sh_addralign as u32).to_le_bytes());
                buf[36..40].copy_from_slice(&(h.sh_entsize as u32).to_le_bytes());
            }
            ElfClass::Elf64 => {
                buf[8..16].copy_from_slice(&h.sh_flags.to_le_bytes());
                buf[16..24].copy_from_slice(&h.sh_addr.to_le_bytes());
                buf[24..32].copy_from_slice(&h.sh_offset.to_le_bytes());
                buf[32..40].copy_from_slice(&h.sh_size.to_le_bytes());
                buf[40..44].copy_from_slice(&h.sh_link.to_le_bytes());
                buf[44..48].copy_from_slice(&h.sh_info.to_le_bytes());
                buf[48..56].copy_from_slice(&h.sh_addralign.to_le_bytes());
                buf[56..64].copy_from_slice(&h.sh_entsize.to_le_bytes());
            }
        }
    }

    pub fn read_dyn(self, data: &[u8], offset: usize) -> Result<Dyn> {
        let s = bytes_at(data, offset, self.dyn_size())?;
        Ok(match self {
            ElfClass::Elf32 => Dyn {d_tag: u32_at(s, 0) as i32 as i64, d_val: u32_at(s, 4) as u64},
            ElfClass::Elf64 => Dyn {d_tag: u64_at(s, 0) as i64, d_val: u64_at(s, 8)},
        })
    }

    pub fn append_dyn(self, out: &mut Vec<u8>, d: &Dyn) {
        match self {
            ElfClass::Elf32 => {
                out.extend_from_slice(&(d.d_tag as i32).to_le_bytes());
                out.extend_from_slice(&(d.d_val as u32).to_le_bytes());
            }
            ElfClass::Elf64 => {
                out.extend_from_slice(&d.d_tag.to_le_bytes());
                out.extend_from_slice(&d.d_val.to_le_bytes());
            }
        }
    }
}

// Validates the parts of the identification and header that the reducer relies
// on. Same checks and order as a debugger would apply before trusting e_ph*.
pub fn open_elf_header(data: &[u8], name: &str) -> Result<(ElfClass, Ehdr)> {
    if data.len() < 16 || &data[..4] != b"\x7fELF" {
        return err!(MalformedElf, "invalid ELF magic bytes in {}", name);
    }
    let class = ElfClass::from_ident(&data[..16])?;
    if data[5] == 2 { return err!(MalformedElf, "big-endian ELF is not supported: {}", name); }
    if data[5] != 1 { return err!(MalformedElf, "invalid EI_DATA: {}", data[5]); }
    if data[6] != 1 { return err!(MalformedElf, "invalid EI_VERSION: {}", data[6]); }

    let header = class.read_ehdr(data)?;
    if header.e_version != 1 { return err!(MalformedElf, "invalid e_version: {}", header.e_version); }
    if header.e_phnum > 0 && (header.e_phentsize as usize) < class.phdr_size() { return err!(MalformedElf, "ELF e_phentsize too small in {}", name); }
    if header.e_shnum > 0 && (header.e_shentsize as usize) < class.shdr_size() { return err!(MalformedElf, "ELF e_shentsize too small in {}", name); }
    if (header.e_phnum as usize).saturating_mul(header.e_phentsize as usize).saturating_add(header.e_phoff as usize) > data.len() { return err!(MalformedElf, "ELF program header out of bounds in {}", name); }
    if (header.e_shnum as usize).saturating_mul(header.e_shentsize as usize).saturating_add(header.e_shoff as usize) > data.len() { return err!(MalformedElf, "ELF section header out of bounds in {}", name); }
    Ok((class, header))
}

pub struct ElfNote<'a> {
    pub type_: u32,
    pub name: &'a [u8],
    pub desc: &'a [u8],
}

// Notes have 4-byte aligned name and desc fields in both classes.
pub fn parse_elf_note<'a>(data: &'a [u8]) -> Result<(ElfNote<'a>, /*remainder*/ &'a [u8])> {
    if data.len() < 12 {
        return err!(MalformedCore, "ELF note header is too short");
    }
    let name_len = u32_at(data, 0) as usize;
    let desc_len = u32_at(data, 4) as usize;
    let type_ = u32_at(data, 8);
    let name_len_padded = (name_len + 3) & !3;
    let desc_len_padded = (desc_len + 3) & !3;
    let pos = 12;
    if name_len_padded.saturating_add(desc_len_padded).saturating_add(pos) > data.len() {
        return err!(MalformedCore, "ELF note is too short");
    }
    Ok((ElfNote {type_, name: &data[pos..pos+name_len], desc: &data[pos+name_len_padded..pos+name_len_padded+desc_len]}, &data[pos+name_len_padded+desc_len_padded..]))
}

// Index of the stack pointer within prstatus pr_reg[], in class-width words.
// i386: sys/reg.h UESP; ARM: r13; x86-64: rsp in user_regs_struct;
// aarch64: sp right after regs[0..30] in user_pt_regs.
pub fn stack_pointer_reg_index(e_machine: u16) -> Result<usize> {
    match e_machine {
        EM_386 => Ok(15),
        EM_ARM => Ok(13),
        EM_X86_64 => Ok(19),
        EM_AARCH64 => Ok(31),
        _ => err!(MalformedCore, "don't know the stack pointer register for e_machine {}", e_machine),
    }
}
