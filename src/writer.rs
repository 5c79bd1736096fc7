use crate::{*, error::*, elf::*};
use std::{fs::File, io::Write};

// The reduced core under construction. One growable buffer: ELF header, a
// reserved program-header region, then segment data in write order. Headers
// are kept as parsed records and serialized at flush, after sorting by
// p_vaddr - segment data is referenced only through p_offset, so sorting the
// table never moves data, it only gives the debugger a binary-searchable
// lookup order.
pub struct RawElfWriter {
    file: File,
    class: ElfClass,
    buffer: Vec<u8>,
    headers: Vec<Phdr>,
    num_headers: usize,
    header: Option<Ehdr>,

    // State of the link-map segment being assembled, if any.
    link_map_header: Option<usize>,
    link_map_head_address: u64,
    previous_link_address: u64,
    current_link_map_size: u64,

    flushed: bool,
}

impl RawElfWriter {
    pub fn create(path: &str, class: ElfClass, num_segments: usize, initial_data_size: usize) -> Result<RawElfWriter> {
        let file = File::create(path)?;
        let header_area = class.ehdr_size() + num_segments * class.phdr_size();
        let mut buffer: Vec<u8> = Vec::with_capacity(header_area + initial_data_size);
        buffer.resize(header_area, 0);
        Ok(RawElfWriter {
            file, class, buffer, headers: Vec::new(), num_headers: num_segments, header: None,
            link_map_header: None, link_map_head_address: 0, previous_link_address: 0, current_link_map_size: 0,
            flushed: false,
        })
    }

    pub fn class(&self) -> ElfClass { self.class }
    pub fn headers(&self) -> &[Phdr] { &self.headers }

    // The input core's header, minus its section table. e_phnum is filled in
    // at flush from the number of headers actually emitted.
    pub fn copy_elf_header(&mut self, src: &Ehdr) {
        let mut h = *src;
        h.e_shnum = 0;
        h.e_shstrndx = 0;
        h.e_shoff = 0;
        h.e_phoff = self.class.ehdr_size() as u64;
        h.e_phentsize = self.class.phdr_size() as u16;
        h.e_ehsize = self.class.ehdr_size() as u16;
        self.header = Some(h);
    }

    fn claim_header_slot(&mut self) -> Result<usize> {
        if self.headers.len() >= self.num_headers {
            return err!(ReducedCoreBroken, "all {} program header slots are already used", self.num_headers);
        }
        Ok(self.headers.len())
    }

    // Copies `data` (the segment's file image) and its header, rewriting
    // p_offset for the new layout. `overwrite` patches a sub-range of the
    // copied bytes; a patch ending exactly at the segment end is legal.
    pub fn copy_segment(&mut self, ph: &Phdr, data: &[u8], overwrite: Option<(u64, &[u8])>) -> Result<()> {
        self.claim_header_slot()?;
        if data.len() as u64 != ph.p_filesz {
            return err!(Internal, "segment data length 0x{:x} doesn't match p_filesz 0x{:x}", data.len(), ph.p_filesz);
        }
        let mut h = *ph;
        h.p_offset = self.buffer.len() as u64;
        let seg_start = self.buffer.len();
        self.buffer.extend_from_slice(data);
        if let Some((off, bytes)) = overwrite {
            if off.saturating_add(bytes.len() as u64) > ph.p_filesz {
                return err!(ReducedCoreBroken, "overwrite of 0x{:x} bytes at 0x{:x} exceeds segment size 0x{:x}", bytes.len(), off, ph.p_filesz);
            }
            self.buffer[seg_start + off as usize..seg_start + off as usize + bytes.len()].copy_from_slice(bytes);
        }
        self.headers.push(h);
        Ok(())
    }

    // Opens the synthetic PT_LOAD that will hold r_debug + the link map chain.
    // Sizes stay zero until finalize_link_map_segment.
    pub fn start_link_map_segment(&mut self, heap_va: u64) -> Result<()> {
        let idx = self.claim_header_slot()?;
        self.headers.push(Phdr {
            p_type: PT_LOAD, p_flags: PF_R | PF_W, p_offset: self.buffer.len() as u64,
            p_vaddr: heap_va, p_align: 1, ..Default::default()
        });
        self.link_map_header = Some(idx);
        self.link_map_head_address = 0;
        self.previous_link_address = 0;
        self.current_link_map_size = 0;
        Ok(())
    }

    // Copies an r_debug image into the segment with its link_map pointer
    // redirected to the chain we're about to write. Returns the VA of the
    // first link_map record in the *source* chain.
    pub fn add_r_debug(&mut self, bytes: &[u8]) -> Result<u64> {
        let idx = match self.link_map_header {
            Some(i) => i,
            None => return err!(Internal, "link map segment not started"),
        };
        if bytes.len() != self.class.r_debug_size() {
            return err!(Internal, "bad r_debug size: {} instead of {}", bytes.len(), self.class.r_debug_size());
        }
        let start = self.buffer.len();
        self.buffer.extend_from_slice(bytes);
        self.link_map_head_address = self.headers[idx].p_vaddr + self.class.r_debug_size() as u64;
        let map_offset = self.class.r_debug_map_offset();
        let head = self.link_map_head_address;
        self.class.write_addr_at(&mut self.buffer[start..], map_offset, head);
        self.class.read_addr(bytes, map_offset)
    }

    // The content only matters as far as the link_map pointer; everything
    // else is left zero.
    pub fn create_r_debug(&mut self) -> Result<u64> {
        let zeroed = vec![0u8; self.class.r_debug_size()];
        self.add_r_debug(&zeroed)
    }

    // Appends one link_map record (5 address words from `record`) plus its
    // NUL-terminated path, rebasing l_name/l_next/l_prev into the new
    // segment's address space. Returns the source record's l_next so the
    // caller can continue walking the original chain.
    pub fn add_link_map_entry(&mut self, record: &[u8], name: Option<&[u8]>) -> Result<u64> {
        if self.link_map_head_address == 0 {
            return err!(Internal, "r_debug must be written before link map entries");
        }
        let class = self.class;
        let word = class.addr_size();
        let l_addr = class.read_addr(record, 0)?;
        let l_ld = class.read_addr(record, 2 * word)?;
        let src_next = class.read_addr(record, 3 * word)?;

        let name_bytes = name.unwrap_or(&[]);
        let lm_size = class.link_map_size() as u64;
        let string_size = name_bytes.len() as u64 + 1;
        let record_va = self.link_map_head_address + self.current_link_map_size;

        class.append_addr(&mut self.buffer, l_addr);
        class.append_addr(&mut self.buffer, record_va + lm_size); // l_name: the string follows the record
        class.append_addr(&mut self.buffer, l_ld);
        class.append_addr(&mut self.buffer, if src_next != 0 {record_va + lm_size + string_size} else {0});
        class.append_addr(&mut self.buffer, self.previous_link_address);
        self.buffer.extend_from_slice(name_bytes);
        self.buffer.push(0);

        self.previous_link_address = record_va;
        self.current_link_map_size += lm_size + string_size;
        Ok(src_next)
    }

    // Fabricates a record when there is no original chain to copy (synthesise
    // mode). next/prev only need to be zero or nonzero here; the rebasing in
    // add_link_map_entry assigns the real addresses.
    pub fn create_link_map_entry(&mut self, addr: u64, name: &str, is_last: bool, is_first: bool) -> Result<()> {
        let class = self.class;
        let mut record: Vec<u8> = Vec::with_capacity(class.link_map_size());
        class.append_addr(&mut record, addr);
        class.append_addr(&mut record, 0);
        class.append_addr(&mut record, 0);
        class.append_addr(&mut record, if is_last {0} else {1});
        class.append_addr(&mut record, if is_first {0} else {1});
        self.add_link_map_entry(&record, Some(name.as_bytes()))?;
        Ok(())
    }

    pub fn finalize_link_map_segment(&mut self) -> Result<()> {
        let idx = match self.link_map_header.take() {
            Some(i) => i,
            None => return err!(Internal, "no link map segment to finalize"),
        };
        let h = &mut self.headers[idx];
        h.p_filesz = self.buffer.len() as u64 - h.p_offset;
        h.p_memsz = h.p_filesz;
        Ok(())
    }

    // Sorts the header table by virtual address and writes the whole buffer
    // out in one go.
    pub fn flush(&mut self) -> Result<()> {
        if self.flushed {
            return Ok(());
        }
        let mut header = match self.header {
            Some(h) => h,
            None => return err!(Internal, "no ELF header was written"),
        };
        self.headers.sort_by_key(|p| p.p_vaddr);
        header.e_phnum = self.headers.len() as u16;
        let ehdr_size = self.class.ehdr_size();
        let phdr_size = self.class.phdr_size();
        self.class.write_ehdr(&mut self.buffer[..ehdr_size], &header);
        for (idx, p) in self.headers.iter().enumerate() {
            let off = ehdr_size + idx * phdr_size;
            self.class.write_phdr(&mut self.buffer[off..off + phdr_size], p);
        }
        self.file.write_all(&self.buffer)?;
        self.buffer = Vec::new();
        self.flushed = true;
        Ok(())
    }
}
