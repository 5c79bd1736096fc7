use crate::{*, error::*, elf::*, core_reader::*, binary_reader::*, procfs::*, writer::*};
use libc::pid_t;

// Safety margin kept below the stack pointer when narrowing a stack segment.
pub const STACK_ADDITION: u64 = 128;

// Link map placement of last resort, for heap-less processes with no usable
// maps file. Above the default vm.mmap_min_addr so debuggers will actually
// dereference it.
pub const PREDEFINED_HEAP_ADDRESS: u64 = 0x10000;

// A link_map chain longer than this is assumed to be cyclic garbage.
const LINK_MAP_WALK_LIMIT: usize = 10000;

// A program header selected for emission: either one of the input core's own
// headers or one we synthesised (narrowed stack, fabricated dynamic section).
pub enum Header<'a> {
    Borrowed(&'a Phdr),
    Owned(Phdr),
}

impl<'a> Header<'a> {
    fn get(&self) -> &Phdr {
        match self {
            Header::Borrowed(p) => *p,
            Header::Owned(p) => p,
        }
    }
}

pub struct Reducer {
    output: String,
    heap_address: u64,

    core: CoreReader,
    note_segment_idx: usize,

    // From the core's notes.
    pub stack_pointers: Vec<u64>,
    pub process_id: pid_t,
    pub executable_name: Option<String>,
    phdr_addr: u64,

    // From the executable, already adjusted by the load bias.
    dynamic_address: u64,
    dynamic_size: u64,
    interp_address: u64,
    interpreter: Option<String>,
}

impl Reducer {
    // Opens the core and the executable and captures everything the reduction
    // needs from them. The executable's mapping is dropped before this
    // returns - only the core stays open.
    pub fn initialize(core_path: &str, binary_path: &str, output: &str, heap_address: u64) -> Result<Reducer> {
        let core = CoreReader::open(core_path)?;
        let mut r = Reducer {
            output: output.to_string(), heap_address, core, note_segment_idx: 0,
            stack_pointers: Vec::new(), process_id: pid_t::MAX, executable_name: None, phdr_addr: 0,
            dynamic_address: 0, dynamic_size: 0, interp_address: 0, interpreter: None,
        };
        r.parse_notes()?;
        r.read_binary(binary_path)?;
        Ok(r)
    }

    pub fn run(&mut self, stacks_only: bool, maps_file: Option<&str>) -> Result<()> {
        self.check_heap_address(maps_file);

        let stacks = self.narrowed_stacks();
        let mut wanted: Vec<Header> = Vec::new();
        wanted.push(Header::Borrowed(&self.core.phdrs[self.note_segment_idx]));
        for h in stacks {
            wanted.push(Header::Owned(h));
        }

        let mut writer = self.copy_initial_segments(&wanted, stacks_only)?;
        if !stacks_only {
            match self.copy_dynamic_section(&mut writer, maps_file) {
                Ok(()) => (),
                // These phases are best-effort: the reduced core is still
                // usable for backtraces without a link map.
                Err(e) if e.is_missing_dynamic_info() || e.is_maps_unparseable() => eprintln!("warning: {}", e),
                Err(e) => return Err(e),
            }
        }
        writer.flush()
    }

    // Pulls the stack pointers, pids, process name and AT_PHDR out of the
    // PT_NOTE segment. The main process has the lowest pid; threads cloned
    // from it get higher ones.
    fn parse_notes(&mut self) -> Result<()> {
        self.note_segment_idx = match self.core.phdrs.iter().position(|p| p.p_type == PT_NOTE) {
            Some(i) => i,
            None => return err!(MalformedCore, "there is no notes segment in the core file"),
        };
        let class = self.core.class;
        let sp_index = stack_pointer_reg_index(self.core.header.e_machine)?;
        let note_segment = self.core.phdrs[self.note_segment_idx];
        let mut data = self.core.segment_data(&note_segment)?;

        while !data.is_empty() {
            let (note, remainder) = parse_elf_note(data)?;
            data = remainder;
            match note.type_ {
                NT_PRSTATUS => {
                    let sp = class.read_addr(note.desc, class.prstatus_reg_offset() + sp_index * class.addr_size())
                        .map_err(|_| error!(MalformedCore, "NT_PRSTATUS note is too short"))?;
                    self.stack_pointers.push(sp);
                    let pid_bytes = bytes_at(note.desc, class.prstatus_pid_offset(), 4)
                        .map_err(|_| error!(MalformedCore, "NT_PRSTATUS note is too short"))?;
                    let pid = i32::from_le_bytes(pid_bytes.try_into().unwrap());
                    if pid < self.process_id {
                        self.process_id = pid;
                    }
                }
                NT_PRPSINFO => {
                    // pr_psargs is argv[0] including the path, which is the
                    // best name we have for the crashed application.
                    let args = bytes_at(note.desc, class.prpsinfo_psargs_offset(), ElfClass::PRPSINFO_PSARGS_LEN)
                        .map_err(|_| error!(MalformedCore, "NT_PRPSINFO note is too short"))?;
                    let len = args.iter().position(|&c| c == 0).unwrap_or(args.len());
                    self.executable_name = Some(String::from_utf8_lossy(&args[..len]).into_owned());
                }
                NT_AUXV => {
                    let mut offset = 0;
                    while offset + class.auxv_size() <= note.desc.len() {
                        let a_type = class.read_addr(note.desc, offset)?;
                        if a_type == AT_NULL {
                            break;
                        }
                        if a_type == AT_PHDR {
                            self.phdr_addr = class.read_addr(note.desc, offset + class.addr_size())?;
                            break;
                        }
                        offset += class.auxv_size();
                    }
                }
                _ => (),
            }
        }

        // Without a pid and a name even the debugger couldn't make sense of
        // this core, so there is no point producing output.
        if self.executable_name.is_none() || self.process_id == pid_t::MAX {
            return err!(MalformedCore, "unable to determine the process id or executable name from the core notes");
        }
        eprintln!("info: core of pid {} ({}), {} thread(s)", self.process_id,
                  self.executable_name.as_deref().unwrap_or(""), self.stack_pointers.len());
        Ok(())
    }

    fn read_binary(&mut self, path: &str) -> Result<()> {
        let binary = BinaryReader::open(path)?;
        if binary.class != self.core.class {
            return err!(MalformedElf, "class mismatch: the core is {} but {} is {}", self.core.class, path, binary.class);
        }

        let load_bias = match (self.phdr_addr, binary.segment_by_type(PT_PHDR)) {
            (0, _) | (_, None) => {
                eprintln!("info: no AT_PHDR or PT_PHDR, assuming load bias 0");
                0u64
            }
            (at_phdr, Some(ph)) => at_phdr.wrapping_sub(ph.p_vaddr),
        };

        match binary.section_by_type(SHT_DYNAMIC) {
            Some(&s) => {
                self.dynamic_address = s.sh_addr.wrapping_add(load_bias);
                self.dynamic_size = s.sh_size;
                // The dynamic linker path comes from the binary because the
                // segment holding it is usually read-only, so its bytes are
                // absent from the core.
                match binary.interp() {
                    Some((addr, name)) => {
                        self.interp_address = addr.wrapping_add(load_bias);
                        self.interpreter = Some(name);
                    }
                    None => eprintln!("info: unable to find an .interp section in a dynamic binary"),
                }
            }
            None => eprintln!("info: no dynamic section in {}, it may be statically linked", path),
        }
        Ok(())
        // binary dropped here; it is not needed past this point
    }

    fn check_heap_address(&mut self, maps_file: Option<&str>) {
        if self.heap_address != 0 {
            return;
        }
        self.heap_address = ProcInterface::new(self.process_id).heap_address(maps_file);
        if self.heap_address == 0 {
            self.heap_address = PREDEFINED_HEAP_ADDRESS;
            eprintln!("warning: no [heap] mapping found, placing the link map at 0x{:x}", self.heap_address);
        }
    }

    // Stacks grow downward, so everything below sp (minus a small margin) is
    // junk; keep only [sp - STACK_ADDITION, end of mapping).
    fn narrowed_stacks(&self) -> Vec<Phdr> {
        let mut res: Vec<Phdr> = Vec::new();
        for &sp in &self.stack_pointers {
            let Some(seg) = self.core.segment_by_address(sp) else { continue };
            let mut h = *seg;
            if sp.saturating_sub(STACK_ADDITION) > h.p_vaddr {
                h.p_vaddr = sp - STACK_ADDITION;
            }
            h.p_filesz = (seg.p_vaddr + seg.p_filesz) - h.p_vaddr;
            h.p_memsz = h.p_filesz;
            h.p_offset += h.p_vaddr - seg.p_vaddr;
            res.push(h);
        }
        res
    }

    fn copy_initial_segments(&self, wanted: &[Header], stacks_only: bool) -> Result<RawElfWriter> {
        let data_size: u64 = wanted.iter().map(|h| h.get().p_filesz).sum();
        // Two extra slots for the dynamic section and the link map segment.
        let extra_headers = if stacks_only {0} else {2};
        let mut writer = RawElfWriter::create(&self.output, self.core.class, wanted.len() + extra_headers, data_size as usize)?;
        writer.copy_elf_header(&self.core.header);
        for h in wanted {
            let ph = h.get();
            writer.copy_segment(ph, self.core.segment_data(ph)?, None)?;
        }
        Ok(writer)
    }

    fn copy_dynamic_section(&self, writer: &mut RawElfWriter, maps_file: Option<&str>) -> Result<()> {
        if self.dynamic_address == 0 {
            return err!(MissingDynamicInfo, "the executable has no dynamic section, skipping the link map");
        }

        // A maps file forces synthesis: don't trust (or copy) the in-core
        // dynamic data, rebuild both the dynamic section and the chain.
        if let Some(maps) = maps_file {
            self.generate_dynamic_section(writer)?;
            return self.create_link_map(writer, maps);
        }

        let Some(&seg) = self.core.segment_by_address(self.dynamic_address) else {
            return err!(MissingDynamicInfo, "the core has no data for the dynamic section at 0x{:x}", self.dynamic_address);
        };
        let class = self.core.class;
        let seg_data = self.core.segment_data(&seg)?;

        // Find DT_DEBUG. Its d_un must be overwritten in the copied segment
        // so the debugger follows it into our link map segment.
        let mut offset = (self.dynamic_address - seg.p_vaddr) as usize;
        let mut debug_entry: Option<(usize, Dyn)> = None;
        while offset + class.dyn_size() <= seg_data.len() {
            let d = class.read_dyn(seg_data, offset)?;
            if d.d_tag == DT_NULL {
                break;
            }
            if d.d_tag == DT_DEBUG {
                debug_entry = Some((offset, d));
                break;
            }
            offset += class.dyn_size();
        }
        let Some((offset, debug_entry)) = debug_entry else {
            return err!(MissingDynamicInfo, "no DT_DEBUG entry in the core's dynamic section");
        };

        let mut heap_word: Vec<u8> = Vec::with_capacity(class.addr_size());
        class.append_addr(&mut heap_word, self.heap_address);
        // d_un sits one word past the tag.
        writer.copy_segment(&seg, seg_data, Some(((offset + class.addr_size()) as u64, &heap_word)))?;

        self.copy_link_map(writer, debug_entry.d_val)
    }

    // Walks the original in-core r_debug/link_map chain and re-emits it,
    // contiguously, at the heap address.
    fn copy_link_map(&self, writer: &mut RawElfWriter, start: u64) -> Result<()> {
        if start == 0 {
            // DT_DEBUG existed but the linker never filled it in (or it was stripped).
            return err!(MissingDynamicInfo, "DT_DEBUG holds no r_debug address, skipping the link map");
        }
        let class = self.core.class;
        let Some(r_debug) = self.core.data_at_address(start, class.r_debug_size() as u64) else {
            return err!(MissingDynamicInfo, "r_debug at 0x{:x} is not present in the core", start);
        };
        let r_debug = r_debug.to_vec();

        writer.start_link_map_segment(self.heap_address)?;
        let mut cursor = writer.add_r_debug(&r_debug)?;
        let mut visited = 0usize;
        while cursor != 0 {
            visited += 1;
            if visited > LINK_MAP_WALK_LIMIT {
                eprintln!("warning: link map chain exceeds {} records, assuming a cycle and truncating", LINK_MAP_WALK_LIMIT);
                break;
            }
            let Some(record) = self.core.data_at_address(cursor, class.link_map_size() as u64) else {
                eprintln!("warning: link_map record at 0x{:x} is not present in the core, truncating the chain", cursor);
                break;
            };
            let name_address = class.read_addr(record, class.lm_name_offset())?;
            let mut name = self.core.cstr_at_address(name_address).map(|s| s.to_vec());
            // The name may live in a read-only mapping that wasn't dumped. If
            // it's the interpreter path we know it from the binary instead.
            if name.is_none() && name_address == self.interp_address {
                name = self.interpreter.as_ref().map(|s| s.as_bytes().to_vec());
            }
            cursor = writer.add_link_map_entry(record, name.as_deref())?;
        }
        writer.finalize_link_map_segment()
    }

    // Stand-in for the original dynamic section when we synthesise the link
    // map. The debugger locates DT_DEBUG by its offset in the executable and
    // reads that address from the core, so every word except the terminator
    // just holds the heap address.
    fn generate_dynamic_section(&self, writer: &mut RawElfWriter) -> Result<()> {
        let class = self.core.class;
        let count = (self.dynamic_size as usize) / class.dyn_size();
        let mut data: Vec<u8> = Vec::with_capacity(self.dynamic_size as usize);
        for _ in 0..count.saturating_sub(1) {
            class.append_dyn(&mut data, &Dyn {d_tag: DT_NULL, d_val: self.heap_address});
        }
        if count > 0 {
            class.append_dyn(&mut data, &Dyn {d_tag: DT_NULL, d_val: 0});
        }
        data.resize(self.dynamic_size as usize, 0);

        let header = Phdr {
            p_type: PT_LOAD, p_flags: PF_R, p_vaddr: self.dynamic_address,
            p_filesz: self.dynamic_size, p_memsz: self.dynamic_size, p_align: 1,
            ..Default::default()
        };
        writer.copy_segment(&header, &data, None)
    }

    // Builds a fresh chain from the maps file: an empty head record (the
    // debugger tolerates it), then one record per loaded shared object.
    fn create_link_map(&self, writer: &mut RawElfWriter, maps_file: &str) -> Result<()> {
        let shared_objects = ProcInterface::new(self.process_id).shared_objects(Some(maps_file))?;
        if shared_objects.is_empty() {
            return err!(MapsUnparseable, "no shared objects in {}, skipping the link map", maps_file);
        }

        writer.start_link_map_segment(self.heap_address)?;
        writer.create_r_debug()?;
        writer.create_link_map_entry(0, "", false, true)?;
        for (idx, so) in shared_objects.iter().enumerate() {
            writer.create_link_map_entry(so.addr, &so.name, idx == shared_objects.len() - 1, false)?;
        }
        writer.finalize_link_map_segment()
    }
}

#[cfg(test)]
mod tests {
    use crate::{reducer::*, core_reader::*, elf::*};
    use std::{fs, io::Write, path::PathBuf};

    struct TestDir {
        dir: PathBuf,
    }
    impl TestDir {
        fn new(name: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("{}_{}", name, std::process::id()));
            let _ = fs::remove_dir_all(&dir);
            fs::create_dir_all(&dir).unwrap();
            TestDir {dir}
        }
        fn path(&self, name: &str) -> String {
            self.dir.join(name).to_str().unwrap().to_string()
        }
        fn write(&self, name: &str, data: &[u8]) -> String {
            let path = self.path(name);
            fs::File::create(&path).unwrap().write_all(data).unwrap();
            path
        }
    }
    impl Drop for TestDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    fn base_ehdr(class: ElfClass, e_type: u16) -> Ehdr {
        let mut h = Ehdr::default();
        h.ident[..4].copy_from_slice(b"\x7fELF");
        (h.ident[4], h.ident[5], h.ident[6]) = (if class == ElfClass::Elf32 {1} else {2}, 1, 1);
        h.e_type = e_type;
        h.e_machine = if class == ElfClass::Elf32 {EM_386} else {EM_X86_64};
        h.e_version = 1;
        h.e_phoff = class.ehdr_size() as u64;
        h.e_ehsize = class.ehdr_size() as u16;
        h.e_phentsize = class.phdr_size() as u16;
        h
    }

    // Assembles a core file: PT_NOTE first, then one PT_LOAD per (vaddr, data).
    struct CoreBuilder {
        class: ElfClass,
        notes: Vec<u8>,
        segments: Vec<(u64, Vec<u8>)>,
    }
    impl CoreBuilder {
        fn new(class: ElfClass) -> Self {
            CoreBuilder {class, notes: Vec::new(), segments: Vec::new()}
        }

        fn add_note(&mut self, type_: u32, desc: &[u8]) {
            let name = b"CORE\0";
            self.notes.extend_from_slice(&(name.len() as u32).to_le_bytes());
            self.notes.extend_from_slice(&(desc.len() as u32).to_le_bytes());
            self.notes.extend_from_slice(&type_.to_le_bytes());
            self.notes.extend_from_slice(name);
            self.notes.resize((self.notes.len() + 3) & !3, 0);
            self.notes.extend_from_slice(desc);
            self.notes.resize((self.notes.len() + 3) & !3, 0);
        }

        fn add_prstatus(&mut self, pid: i32, sp: u64) {
            let class = self.class;
            let size = if class == ElfClass::Elf32 {144} else {336};
            let mut desc = vec![0u8; size];
            desc[class.prstatus_pid_offset()..class.prstatus_pid_offset() + 4].copy_from_slice(&pid.to_le_bytes());
            let sp_index = stack_pointer_reg_index(if class == ElfClass::Elf32 {EM_386} else {EM_X86_64}).unwrap();
            class.write_addr_at(&mut desc, class.prstatus_reg_offset() + sp_index * class.addr_size(), sp);
            self.add_note(NT_PRSTATUS, &desc);
        }

        fn add_prpsinfo(&mut self, psargs: &str) {
            let class = self.class;
            let size = if class == ElfClass::Elf32 {124} else {136};
            let mut desc = vec![0u8; size];
            let off = class.prpsinfo_psargs_offset();
            desc[off..off + psargs.len()].copy_from_slice(psargs.as_bytes());
            self.add_note(NT_PRPSINFO, &desc);
        }

        fn add_auxv(&mut self, at_phdr: u64) {
            let class = self.class;
            let mut desc: Vec<u8> = Vec::new();
            class.append_addr(&mut desc, AT_PHDR);
            class.append_addr(&mut desc, at_phdr);
            class.append_addr(&mut desc, AT_NULL);
            class.append_addr(&mut desc, 0);
            self.add_note(NT_AUXV, &desc);
        }

        fn add_load(&mut self, vaddr: u64, data: Vec<u8>) {
            self.segments.push((vaddr, data));
        }

        fn build(&self) -> Vec<u8> {
            let class = self.class;
            let phnum = 1 + self.segments.len();
            let mut header = base_ehdr(class, ET_CORE);
            header.e_phnum = phnum as u16;
            let mut offset = class.ehdr_size() + phnum * class.phdr_size();
            let mut phdrs: Vec<Phdr> = Vec::new();
            phdrs.push(Phdr {p_type: PT_NOTE, p_offset: offset as u64, p_filesz: self.notes.len() as u64, p_align: 4, ..Default::default()});
            offset += self.notes.len();
            for (vaddr, data) in &self.segments {
                phdrs.push(Phdr {p_type: PT_LOAD, p_flags: PF_R | PF_W, p_offset: offset as u64, p_vaddr: *vaddr,
                                 p_filesz: data.len() as u64, p_memsz: data.len() as u64, p_align: 1, ..Default::default()});
                offset += data.len();
            }
            let mut buf = vec![0u8; class.ehdr_size()];
            class.write_ehdr(&mut buf, &header);
            for p in &phdrs {
                let at = buf.len();
                buf.resize(at + class.phdr_size(), 0);
                class.write_phdr(&mut buf[at..], p);
            }
            buf.extend_from_slice(&self.notes);
            for (_, data) in &self.segments {
                buf.extend_from_slice(data);
            }
            buf
        }
    }

    // Executable with PT_PHDR and, optionally, .interp + .dynamic sections.
    fn build_binary(class: ElfClass, phdr_vaddr: u64, dynamic: Option<(u64, &[u8])>, interp: Option<(u64, &str)>) -> Vec<u8> {
        let shstrtab = b"\0.interp\0.dynamic\0.shstrtab\0";
        let mut header = base_ehdr(class, ET_EXEC);
        header.e_phnum = 1;
        header.e_shentsize = class.shdr_size() as u16;

        let mut sections: Vec<Shdr> = vec![Shdr::default()];
        let mut data: Vec<u8> = Vec::new();
        let data_start = class.ehdr_size() + class.phdr_size();
        if let Some((addr, path)) = interp {
            sections.push(Shdr {sh_name: 1, sh_type: SHT_PROGBITS, sh_addr: addr, sh_offset: (data_start + data.len()) as u64,
                                sh_size: path.len() as u64 + 1, ..Default::default()});
            data.extend_from_slice(path.as_bytes());
            data.push(0);
        }
        if let Some((addr, contents)) = dynamic {
            sections.push(Shdr {sh_name: 9, sh_type: SHT_DYNAMIC, sh_addr: addr, sh_offset: (data_start + data.len()) as u64,
                                sh_size: contents.len() as u64, sh_entsize: class.dyn_size() as u64, ..Default::default()});
            data.extend_from_slice(contents);
        }
        sections.push(Shdr {sh_name: 18, sh_type: SHT_STRTAB, sh_offset: (data_start + data.len()) as u64,
                            sh_size: shstrtab.len() as u64, ..Default::default()});
        data.extend_from_slice(shstrtab);

        header.e_shnum = sections.len() as u16;
        header.e_shstrndx = sections.len() as u16 - 1;
        header.e_shoff = (data_start + data.len()) as u64;

        let mut buf = vec![0u8; class.ehdr_size()];
        class.write_ehdr(&mut buf, &header);
        let at = buf.len();
        buf.resize(at + class.phdr_size(), 0);
        class.write_phdr(&mut buf[at..], &Phdr {p_type: PT_PHDR, p_flags: PF_R, p_offset: class.ehdr_size() as u64,
                                                p_vaddr: phdr_vaddr, p_filesz: class.phdr_size() as u64,
                                                p_memsz: class.phdr_size() as u64, p_align: 8, ..Default::default()});
        buf.extend_from_slice(&data);
        for s in &sections {
            let at = buf.len();
            buf.resize(at + class.shdr_size(), 0);
            class.write_shdr(&mut buf[at..], s);
        }
        buf
    }

    const BIAS: u64 = 0x5555_0000_0000;
    const DYNAMIC_VA: u64 = BIAS + 0x2000;
    const RDEBUG_VA: u64 = BIAS + 0x3000;
    const INTERP_VA: u64 = BIAS + 0x200;
    const HEAP: u64 = 0x604a000;
    const STACKS: [(u64, u64); 3] = [(0x7ffd1000, 0x7ffd1800), (0x7ffe1000, 0x7ffe1900), (0x7fff1000, 0x7fff1a00)];

    // A three-thread dynamically linked 64-bit crash: dynamic segment with
    // DT_DEBUG, r_debug + 3-record chain, with the last record's name string
    // at the (undumped) .interp address.
    fn build_dynamic_fixture(dir: &TestDir) -> (String, String) {
        let class = ElfClass::Elf64;
        let word = class.addr_size();

        let mut dynamic: Vec<u8> = Vec::new();
        class.append_dyn(&mut dynamic, &Dyn {d_tag: 1 /*DT_NEEDED*/, d_val: 0x17});
        class.append_dyn(&mut dynamic, &Dyn {d_tag: DT_DEBUG, d_val: RDEBUG_VA});
        class.append_dyn(&mut dynamic, &Dyn {d_tag: DT_NULL, d_val: 0});

        // r_debug at RDEBUG_VA, records at +0x100 spaced 0x40 apart, strings at +0x200.
        let rec_va = |i: u64| RDEBUG_VA + 0x100 + i * 0x40;
        let names = ["/lib/x86_64-linux-gnu/libc.so.6", "/lib/x86_64-linux-gnu/libpthread.so.0"];
        let mut debug_seg = vec![0u8; 0x300];
        class.write_addr_at(&mut debug_seg, 0, 1); // r_version
        class.write_addr_at(&mut debug_seg, class.r_debug_map_offset(), rec_va(0));
        let mut string_off = 0x200usize;
        for i in 0..3u64 {
            let base = (0x100 + i * 0x40) as usize;
            class.write_addr_at(&mut debug_seg, base, 0x7f00_0000_0000 + i * 0x20_0000); // l_addr
            if i < 2 {
                class.write_addr_at(&mut debug_seg, base + word, RDEBUG_VA + string_off as u64);
                let name = names[i as usize].as_bytes();
                debug_seg[string_off..string_off + name.len()].copy_from_slice(name);
                string_off += name.len() + 1;
            } else {
                // name lives at .interp, which is not dumped
                class.write_addr_at(&mut debug_seg, base + word, INTERP_VA);
            }
            class.write_addr_at(&mut debug_seg, base + 3 * word, if i < 2 {rec_va(i + 1)} else {0});
            class.write_addr_at(&mut debug_seg, base + 4 * word, if i > 0 {rec_va(i - 1)} else {0});
        }

        let mut core = CoreBuilder::new(class);
        core.add_prstatus(1001, STACKS[0].1);
        core.add_prstatus(1002, STACKS[1].1);
        core.add_prstatus(1000, STACKS[2].1);
        core.add_prpsinfo("/usr/bin/testprog");
        core.add_auxv(BIAS + 0x40);
        for &(vaddr, _) in &STACKS {
            core.add_load(vaddr, vec![0xaa; 0x1000]);
        }
        core.add_load(DYNAMIC_VA, dynamic.clone());
        core.add_load(RDEBUG_VA, debug_seg);

        let core_path = dir.write("core", &core.build());
        let binary_path = dir.write("testprog", &build_binary(class, 0x40,
            Some((0x2000, &dynamic)), Some((0x200, "/lib64/ld-linux-x86-64.so.2"))));
        (core_path, binary_path)
    }

    fn read_link_map(core: &CoreReader, heap: u64) -> Vec<(u64, String)> {
        let class = core.class;
        let word = class.addr_size();
        let rd = core.data_at_address(heap, class.r_debug_size() as u64).unwrap();
        let mut cursor = class.read_addr(rd, class.r_debug_map_offset()).unwrap();
        assert_eq!(cursor, heap + class.r_debug_size() as u64);
        let seg = core.segment_by_address(heap).unwrap();
        let seg_end = seg.p_vaddr + seg.p_filesz;
        let mut res: Vec<(u64, String)> = Vec::new();
        let mut prev = 0u64;
        while cursor != 0 {
            assert!(cursor >= heap && cursor + class.link_map_size() as u64 <= seg_end, "chain escapes the segment");
            let rec = core.data_at_address(cursor, class.link_map_size() as u64).unwrap();
            let l_name = class.read_addr(rec, word).unwrap();
            assert!(l_name > heap && l_name < seg_end, "name pointer escapes the segment");
            let name = String::from_utf8(core.cstr_at_address(l_name).unwrap().to_vec()).unwrap();
            assert_eq!(class.read_addr(rec, 4 * word).unwrap(), prev);
            res.push((class.read_addr(rec, 0).unwrap(), name));
            prev = cursor;
            cursor = class.read_addr(rec, 3 * word).unwrap();
        }
        res
    }

    #[test]
    fn copy_mode_end_to_end() {
        let dir = TestDir::new("reducer_copy_mode");
        let (core_path, binary_path) = build_dynamic_fixture(&dir);
        let out_path = dir.path("reduced");

        let mut reducer = Reducer::initialize(&core_path, &binary_path, &out_path, HEAP).unwrap();
        assert_eq!(reducer.process_id, 1000);
        assert_eq!(reducer.executable_name.as_deref(), Some("/usr/bin/testprog"));
        reducer.run(false, None).unwrap();

        let out = CoreReader::open(&out_path).unwrap();
        assert_eq!(out.header.e_phnum, 6); // notes + 3 stacks + dynamic + link map
        assert_eq!(out.header.e_type, ET_CORE);
        assert_eq!(out.header.e_shoff, 0);
        let mut prev = 0u64;
        for p in &out.phdrs {
            assert!(p.p_vaddr >= prev);
            prev = p.p_vaddr;
            assert!(p.p_offset + p.p_filesz <= out.data().len() as u64);
        }

        // narrowed stacks: [sp - 128, end of original mapping)
        for &(seg_va, sp) in &STACKS {
            let p = out.segment_by_address(sp).unwrap();
            assert_eq!(p.p_vaddr, sp - STACK_ADDITION);
            assert_eq!(p.p_vaddr + p.p_filesz, seg_va + 0x1000);
            assert!(p.p_vaddr >= seg_va && p.p_vaddr <= sp);
        }

        // DT_DEBUG redirected to the heap segment
        let class = out.class;
        let dyn_data = out.data_at_address(DYNAMIC_VA, 3 * class.dyn_size() as u64).unwrap();
        let patched = class.read_dyn(dyn_data, class.dyn_size()).unwrap();
        assert_eq!(patched.d_tag, DT_DEBUG);
        assert_eq!(patched.d_val, HEAP);

        // chain closure, with the interpreter name recovered from the binary
        let chain = read_link_map(&out, HEAP);
        let names: Vec<&str> = chain.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(names, ["/lib/x86_64-linux-gnu/libc.so.6", "/lib/x86_64-linux-gnu/libpthread.so.0", "/lib64/ld-linux-x86-64.so.2"]);
        assert_eq!(chain[1].0, 0x7f00_0020_0000);
    }

    #[test]
    fn stacks_only_mode() {
        let dir = TestDir::new("reducer_stacks_only");
        let (core_path, binary_path) = build_dynamic_fixture(&dir);
        let out_path = dir.path("reduced");

        let mut reducer = Reducer::initialize(&core_path, &binary_path, &out_path, HEAP).unwrap();
        reducer.run(true, None).unwrap();

        let out = CoreReader::open(&out_path).unwrap();
        assert_eq!(out.header.e_phnum as usize, 1 + STACKS.len());
        assert!(out.segment_by_type(PT_NOTE).is_some());
        assert!(out.segment_by_address(DYNAMIC_VA).is_none());
        assert!(out.segment_by_address(HEAP).is_none());
    }

    #[test]
    fn synthesise_mode_from_maps_file() {
        let dir = TestDir::new("reducer_synthesise");
        let (core_path, binary_path) = build_dynamic_fixture(&dir);
        let out_path = dir.path("reduced");
        let maps_path = dir.write("maps", b"\
7f0000000000-7f0000100000 r-xp 00000000 08:01 11 /lib/x86_64-linux-gnu/libc.so.6\n\
7f0000200000-7f0000300000 r-xp 00000000 08:01 12 /lib/x86_64-linux-gnu/libpthread.so.0\n\
7f0000400000-7f0000500000 r-xp 00000000 08:01 13 /lib64/ld-linux-x86-64.so.2\n\
7ffd1000000-7ffd1001000 rw-p 00000000 00:00 0 [stack]\n");

        let mut reducer = Reducer::initialize(&core_path, &binary_path, &out_path, HEAP).unwrap();
        reducer.run(false, Some(&maps_path)).unwrap();

        let out = CoreReader::open(&out_path).unwrap();
        assert_eq!(out.header.e_phnum, 6);

        // the dynamic segment is synthetic: every entry is the heap word, the
        // last is the DT_NULL terminator
        let class = out.class;
        let seg = *out.segment_by_address(DYNAMIC_VA).unwrap();
        assert_eq!(seg.p_flags, PF_R);
        let data = out.segment_data(&seg).unwrap();
        let count = data.len() / class.dyn_size();
        for i in 0..count {
            let d = class.read_dyn(data, i * class.dyn_size()).unwrap();
            assert_eq!(d.d_tag, DT_NULL);
            assert_eq!(d.d_val, if i + 1 < count {HEAP} else {0});
        }

        // synthesised chain: empty head + one record per shared object
        let chain = read_link_map(&out, HEAP);
        assert_eq!(chain.len(), 4);
        assert_eq!(chain[0], (0, String::new()));
        assert_eq!(chain[1], (0x7f0000000000, "/lib/x86_64-linux-gnu/libc.so.6".to_string()));
        assert_eq!(chain[3], (0x7f0000400000, "/lib64/ld-linux-x86-64.so.2".to_string()));
    }

    #[test]
    fn static_32bit_core_skips_dynamic_phases() {
        let dir = TestDir::new("reducer_static32");
        let class = ElfClass::Elf32;
        let mut core = CoreBuilder::new(class);
        core.add_prstatus(512, 0xbf8ff1a0);
        core.add_prpsinfo("/bin/true");
        core.add_auxv(0x08048034);
        core.add_load(0xbf8f0000, vec![0xbb; 0x10000]);
        let core_path = dir.write("core32", &core.build());
        // statically linked: no .dynamic, no .interp
        let binary_path = dir.write("true", &build_binary(class, 0x08048034, None, None));
        let out_path = dir.path("reduced");

        let mut reducer = Reducer::initialize(&core_path, &binary_path, &out_path, 0x1234).unwrap();
        reducer.run(false, None).unwrap();

        let out = CoreReader::open(&out_path).unwrap();
        assert_eq!(out.class, ElfClass::Elf32);
        assert_eq!(out.header.e_phnum, 2); // just the notes and the stack
        let stack = out.segment_by_address(0xbf8ff1a0).unwrap();
        assert_eq!(stack.p_vaddr, 0xbf8ff1a0 - STACK_ADDITION);
        assert_eq!(stack.p_vaddr + stack.p_filesz, 0xbf8f0000 + 0x10000);
    }

    #[test]
    fn core_without_prstatus_is_rejected() {
        let dir = TestDir::new("reducer_no_prstatus");
        let mut core = CoreBuilder::new(ElfClass::Elf64);
        core.add_prpsinfo("/bin/crash");
        core.add_load(0x1000, vec![0; 16]);
        let core_path = dir.write("core", &core.build());
        let binary_path = dir.write("bin", &build_binary(ElfClass::Elf64, 0x40, None, None));
        assert!(Reducer::initialize(&core_path, &binary_path, &dir.path("out"), 0).is_err());
    }

    #[test]
    fn sp_outside_any_segment_is_skipped() {
        let dir = TestDir::new("reducer_sp_miss");
        let mut core = CoreBuilder::new(ElfClass::Elf64);
        core.add_prstatus(7, 0xdead0000); // no segment covers this
        core.add_prstatus(8, 0x7ffd1800);
        core.add_prpsinfo("/bin/x");
        core.add_auxv(0x40);
        core.add_load(0x7ffd1000, vec![0; 0x1000]);
        let core_path = dir.write("core", &core.build());
        let binary_path = dir.write("bin", &build_binary(ElfClass::Elf64, 0x40, None, None));
        let out_path = dir.path("out");
        let mut reducer = Reducer::initialize(&core_path, &binary_path, &out_path, 0x5000).unwrap();
        reducer.run(true, None).unwrap();
        let out = CoreReader::open(&out_path).unwrap();
        assert_eq!(out.header.e_phnum, 2); // notes + the one resolvable stack
    }
}
