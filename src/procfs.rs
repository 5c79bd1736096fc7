use crate::{*, error::*};
use bitflags::*;
use libc::pid_t;
use std::{fs::File, io::{BufRead, BufReader}};

bitflags! { pub struct MemMapPermissions: u8 {
        const READ = 0b00001;
        const WRITE = 0b00010;
        const EXECUTE = 0b00100;
        const SHARED = 0b01000;
        const PRIVATE = 0b10000;
}}

#[derive(Clone, Debug)]
pub struct MemMapInfo {
    pub start: u64,
    pub len: u64,
    pub perms: MemMapPermissions,
    pub offset: u64,
    pub inode: u64,
    pub path: Option<String>,
}

// One executable shared object from the maps file: base address + pathname.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedObject {
    pub addr: u64,
    pub name: String,
}

// Information from /proc/[pid]/maps, or a saved copy of it captured at crash time.
pub fn parse_maps_file(path: &str) -> Result<Vec<MemMapInfo>> {
    let reader = BufReader::new(File::open(path).map_err(|e| error!(MapsUnparseable, "can't open {}: {}", path, e))?);
    let mut res: Vec<MemMapInfo> = Vec::new();
    for line in reader.lines() {
        let line = line?;

        // The last field of the line is path. It can contain spaces (including trailing).
        // So we can't just use line.split_whitespace() or splitn(6) - the former loses
        // the path's spaces, the latter doesn't skip repeated spaces between fields.

        let mut s = line.trim_start().splitn(2, ' ');
        let (range, rest) = (s.next(), s.next());
        if rest.is_none() { return err!(MapsUnparseable, "too few fields in {}", path); }

        let mut s = range.unwrap().splitn(2, '-');
        let (start, end) = (s.next(), s.next());
        if end.is_none() { return err!(MapsUnparseable, "bad address range in {}", path); }
        let start = u64::from_str_radix(start.unwrap(), 16).map_err(|e| error!(MapsUnparseable, "bad address in {}: {}", path, e))?;
        let end = u64::from_str_radix(end.unwrap(), 16).map_err(|e| error!(MapsUnparseable, "bad address in {}: {}", path, e))?;

        let mut s = rest.unwrap().trim_start().splitn(2, ' ');
        let (perms, rest) = (s.next(), s.next());
        if rest.is_none() { return err!(MapsUnparseable, "too few fields in {}", path); }
        let mut permissions = MemMapPermissions::empty();
        for ch in perms.unwrap().chars() {
            match ch {
                'r' => permissions.insert(MemMapPermissions::READ),
                'w' => permissions.insert(MemMapPermissions::WRITE),
                'x' => permissions.insert(MemMapPermissions::EXECUTE),
                's' => permissions.insert(MemMapPermissions::SHARED),
                'p' => permissions.insert(MemMapPermissions::PRIVATE),
                _ => (),
            }
        }

        let mut s = rest.unwrap().trim_start().splitn(2, ' ');
        let (offset, rest) = (s.next(), s.next());
        if rest.is_none() { return err!(MapsUnparseable, "too few fields in {}", path); }
        let offset = u64::from_str_radix(offset.unwrap(), 16).map_err(|e| error!(MapsUnparseable, "bad offset in {}: {}", path, e))?;

        let mut s = rest.unwrap().trim_start().splitn(2, ' ');
        let (_dev, rest) = (s.next(), s.next());
        if rest.is_none() { return err!(MapsUnparseable, "too few fields in {}", path); }

        let mut s = rest.unwrap().trim_start().splitn(2, ' ');
        let (inode, rest) = (s.next(), s.next());
        if inode.is_none() { return err!(MapsUnparseable, "too few fields in {}", path); }
        let inode = u64::from_str_radix(inode.unwrap(), 10).map_err(|e| error!(MapsUnparseable, "bad inode in {}: {}", path, e))?;

        let path_field = match rest { None => None, Some(p) => Some(p.trim_start().to_string()) };

        res.push(MemMapInfo {start, len: end - start, perms: permissions, offset, inode, path: path_field});
    }
    Ok(res)
}

pub struct ProcInterface {
    pid: pid_t,
}

impl ProcInterface {
    pub fn new(pid: pid_t) -> Self {
        ProcInterface {pid}
    }

    fn maps_path(&self, maps_file: Option<&str>) -> String {
        match maps_file {
            Some(f) => f.to_string(),
            None => format!("/proc/{}/maps", self.pid),
        }
    }

    // Start address of the [heap] mapping, 0 if there is none or the file is
    // unreadable (the caller has a fallback either way).
    pub fn heap_address(&self, maps_file: Option<&str>) -> u64 {
        let path = self.maps_path(maps_file);
        match parse_maps_file(&path) {
            Ok(maps) => maps.iter().find(|m| m.path.as_deref() == Some("[heap]")).map_or(0, |m| m.start),
            Err(e) => {
                eprintln!("warning: {}", e);
                0
            }
        }
    }

    // Executable shared-object mappings: the "r-xp" lines naming a .so that
    // hasn't been deleted, in file order.
    pub fn shared_objects(&self, maps_file: Option<&str>) -> Result<Vec<SharedObject>> {
        let path = self.maps_path(maps_file);
        let maps = parse_maps_file(&path)?;
        let mut res: Vec<SharedObject> = Vec::new();
        for m in &maps {
            let Some(p) = &m.path else { continue };
            if !m.perms.contains(MemMapPermissions::READ | MemMapPermissions::EXECUTE | MemMapPermissions::PRIVATE)
                || m.perms.contains(MemMapPermissions::WRITE) {
                continue;
            }
            if !p.contains(".so") || p.contains("(deleted)") {
                continue;
            }
            res.push(SharedObject {addr: m.start, name: p.clone()});
        }
        Ok(res)
    }
}
