use core_reducer::{reducer::*};
use std::{collections::HashSet, fs, process};

fn print_usage(prog_name: &str) {
    eprintln!("Usage:");
    eprintln!("\t{} [-options]", prog_name);
    eprintln!("Options:\n\
               \t-i input core\n\
               \t-o output core\n\
               \t-e executable\n\
               \t[-a memory address (hex) for the link map]\n\
               \t[-m maps file]\n\
               \t[-s] stacks only\n\
               \t[-h] this message");
}

fn parse_arg(args: &mut &[String], seen_args: &mut HashSet<String>, long_name: &str, short_name: &str, bool_switch: bool) -> Option<String> {
    assert!(!args.is_empty());
    if args[0].is_empty() {
        return None;
    }
    if !long_name.is_empty() && args[0].starts_with(long_name) && args[0][long_name.len()..].starts_with("=") {
        if !seen_args.insert(long_name.to_string()) {
            eprintln!("{} can't be specified multiple times", long_name);
            process::exit(-1);
        }
        if bool_switch {
            eprintln!("{} doesn't accept a value", long_name);
            process::exit(-1);
        }
        let v = args[0][long_name.len()+1..].to_string();
        *args = &args[1..];
        return Some(v);
    }
    if &args[0][..] == short_name || &args[0][..] == long_name {
        let name = if &args[0][..] == short_name {short_name} else {long_name};
        if !seen_args.insert(name.to_string()) {
            eprintln!("{} can't be specified multiple times", name);
            process::exit(-1);
        }
        if bool_switch {
            *args = &args[1..];
            return Some(String::new());
        }
        if args.len() == 1 {
            eprintln!("{} requires an argument", name);
            process::exit(-1);
        }
        let v = args[1].clone();
        *args = &args[2..];
        return Some(v);
    }
    None
}

fn main() {
    let all_args: Vec<String> = std::env::args().collect();
    let prog_name = all_args.get(0).map_or("core-reducer", |s| &s[..]).to_string();
    let mut args = &all_args[1..];
    let mut seen_args: HashSet<String> = HashSet::new();

    let mut input_file: Option<String> = None;
    let mut output_file: Option<String> = None;
    let mut executable: Option<String> = None;
    let mut maps_file: Option<String> = None;
    let mut heap_address = 0u64;
    let mut stacks_only = false;

    while !args.is_empty() {
        if let Some(v) = parse_arg(&mut args, &mut seen_args, "--input", "-i", false) {
            input_file = Some(v);
        } else if let Some(v) = parse_arg(&mut args, &mut seen_args, "--output", "-o", false) {
            output_file = Some(v);
        } else if let Some(v) = parse_arg(&mut args, &mut seen_args, "--executable", "-e", false) {
            executable = Some(v);
        } else if let Some(v) = parse_arg(&mut args, &mut seen_args, "--maps", "-m", false) {
            maps_file = Some(v);
        } else if let Some(v) = parse_arg(&mut args, &mut seen_args, "--address", "-a", false) {
            heap_address = match u64::from_str_radix(v.trim_start_matches("0x"), 16) {
                Ok(x) => x,
                Err(_) => {
                    eprintln!("invalid -a address (expected hex): {}", v);
                    process::exit(-1);
                }
            };
        } else if let Some(_) = parse_arg(&mut args, &mut seen_args, "--stacks-only", "-s", true) {
            stacks_only = true;
        } else if let Some(_) = parse_arg(&mut args, &mut seen_args, "--help", "-h", true) {
            print_usage(&prog_name);
            process::exit(-1);
        } else {
            eprintln!("unrecognized argument: {}", args[0]);
            print_usage(&prog_name);
            process::exit(-1);
        }
    }

    let (Some(input_file), Some(output_file), Some(executable)) = (input_file, output_file, executable) else {
        print_usage(&prog_name);
        process::exit(-1);
    };

    let mut reducer = match Reducer::initialize(&input_file, &executable, &output_file, heap_address) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(-1);
        }
    };

    match reducer.run(stacks_only, maps_file.as_deref()) {
        Ok(()) => (),
        Err(e) => {
            eprintln!("error: {}", e);
            // A partial output is worse than none: nothing should try to load it.
            let _ = fs::remove_file(&output_file);
            process::exit(-1);
        }
    }
}
