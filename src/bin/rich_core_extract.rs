// Splits a rich-core archive - a (possibly lzop-compressed) concatenation of
// files delimited by "[---rich-core: <basename>---]\n" markers - into separate
// files under an output directory. Independent of the reducer; it only knows
// the marker grammar.

use std::{env, fs, ops::Range, path::Path, process, process::Command};

const HEADER_START: &[u8] = b"[---rich-core: ";
const HEADER_END: &[u8] = b"---]\n";

fn find(data: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from > data.len() {
        return None;
    }
    data[from..].windows(needle.len()).position(|w| w == needle).map(|p| p + from)
}

// (name, byte range) of every archived file. Data before the first marker is
// the uninteresting carrier stream and is dropped, as is the newline
// separating each file from the following marker. A start marker with no
// terminator invalidates the rest of the stream.
fn split_archive(data: &[u8]) -> Vec<(String, Range<usize>)> {
    let mut sections: Vec<(String, Range<usize>)> = Vec::new();
    let mut pos = match find(data, 0, HEADER_START) {
        Some(p) => p,
        None => return sections,
    };
    while pos < data.len() {
        let name_start = pos + HEADER_START.len();
        let Some(name_end) = find(data, name_start, HEADER_END) else {
            eprintln!("warning: skipping invalid rich core header");
            break;
        };
        let name = String::from_utf8_lossy(&data[name_start..name_end]);
        let name = name.rsplit('/').next().unwrap_or("").to_string();
        let content_start = name_end + HEADER_END.len();
        let content_end = match find(data, content_start, HEADER_START) {
            // Don't include the newline that precedes the next marker.
            Some(next) => next.saturating_sub(1).max(content_start),
            None => data.len(),
        };
        sections.push((name, content_start..content_end));
        pos = match find(data, content_end, HEADER_START) {
            Some(next) => next,
            None => break,
        };
    }
    sections
}

fn fail(message: String) -> ! {
    eprintln!("{}", message);
    process::exit(1);
}

fn read_input(input: &str) -> Vec<u8> {
    if input.ends_with(".lzo") {
        let out = match Command::new("lzop").args(["-d", "-c", input]).output() {
            Ok(o) => o,
            Err(e) => fail(format!("error forking lzop: {}", e)),
        };
        if !out.status.success() {
            fail(format!("lzop -d -c {} failed: {}", input, String::from_utf8_lossy(&out.stderr).trim_end()));
        }
        out.stdout
    } else {
        match fs::read(input) {
            Ok(d) => d,
            Err(e) => fail(format!("input file error: {}", e)),
        }
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("{} <input filename> [<output directory>]", args[0]);
        process::exit(1);
    }
    let input = &args[1];
    let output_dir = match args.get(2) {
        Some(d) => d.clone(),
        None => {
            if let Some(base) = input.strip_suffix(".rcore.lzo").or_else(|| input.strip_suffix(".rcore")) {
                base.to_string()
            } else {
                fail("please specify output directory".to_string())
            }
        }
    };

    match fs::metadata(input) {
        Ok(m) if m.is_dir() => fail(format!("{} is a directory", input)),
        Ok(_) => (),
        Err(e) => fail(format!("input file error: {}", e)),
    }
    if Path::new(&output_dir).exists() {
        fail(format!("{} exists, aborting", output_dir));
    }
    if let Err(e) = fs::create_dir_all(&output_dir) {
        fail(format!("error creating {}: {}", output_dir, e));
    }

    let data = read_input(input);
    for (name, range) in split_archive(&data) {
        if name.is_empty() {
            eprintln!("warning: skipping a rich core section with an empty name");
            continue;
        }
        let path = format!("{}/{}", output_dir, name);
        if let Err(e) = fs::write(&path, &data[range]) {
            fail(format!("error writing {}: {}", path, e));
        }
    }
}
