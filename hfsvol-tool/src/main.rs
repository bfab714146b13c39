//! hfsvol-tool — create and explore HFS+ volume images
//!
//! # Usage
//!
//! ```text
//! hfsvol-tool mkfs <image> [-s size-mb] [-b block-size] [-n name] [-x]
//! hfsvol-tool info <image>                 Volume header and counters
//! hfsvol-tool ls   <image> [path]          List directory contents
//! hfsvol-tool tree <image> [path]          Browse the filesystem tree
//! hfsvol-tool cat  <image> <path>          File contents to stdout
//! hfsvol-tool stat <image> <path>          File metadata
//! ```

mod style;

use std::env;
use std::fs::OpenOptions;
use std::io::Write;
use std::process;

use hfsvol::{FormatParams, MountOptions, Volume};
use style::*;

type ToolResult = Result<(), Box<dyn std::error::Error>>;

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "mkfs" => mkfs(&args[2..]),
        "info" => info(&args[2..]),
        "ls" => ls(&args[2..]),
        "tree" => tree(&args[2..]),
        "cat" => cat(&args[2..]),
        "stat" => stat(&args[2..]),
        "-h" | "--help" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            eprintln!("{RED}Unknown command: {}{RESET}", args[1]);
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("{RED}error:{RESET} {e}");
        process::exit(1);
    }
}

fn print_usage() {
    eprintln!(
        r#"
{BOLD}hfsvol-tool{RESET} — HFS+ volume image explorer

{BOLD}USAGE:{RESET}
    hfsvol-tool <COMMAND> [OPTIONS]

{BOLD}COMMANDS:{RESET}
    {GREEN}mkfs{RESET}    <image> [-s mb] [-b bytes] [-n name] [-x]   Create an empty volume
    {GREEN}info{RESET}    <image>                                    Volume header and counters
    {GREEN}ls{RESET}      <image> [path]                             List directory contents
    {GREEN}tree{RESET}    <image> [path]                             Browse filesystem tree
    {GREEN}cat{RESET}     <image> <path>                             File contents to stdout
    {GREEN}stat{RESET}    <image> <path>                             File metadata

{BOLD}EXAMPLES:{RESET}
    hfsvol-tool mkfs scratch.img -s 64 -n "Scratch"
    hfsvol-tool ls scratch.img /
    hfsvol-tool cat backup.img /Documents/notes.txt
"#
    );
}

fn open_volume(image: &str) -> Result<Volume<std::fs::File>, Box<dyn std::error::Error>> {
    let file = OpenOptions::new().read(true).write(true).open(image)?;
    Ok(Volume::mount(file, MountOptions::default())?)
}

fn mkfs(args: &[String]) -> ToolResult {
    let image = args.first().ok_or("mkfs: missing image path")?;
    let mut size_mb: u64 = 64;
    let mut params = FormatParams::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-s" => {
                size_mb = args.get(i + 1).ok_or("mkfs: -s needs a value")?.parse()?;
                i += 2;
            }
            "-b" => {
                params.block_size = args.get(i + 1).ok_or("mkfs: -b needs a value")?.parse()?;
                i += 2;
            }
            "-n" => {
                params.volume_name = args.get(i + 1).ok_or("mkfs: -n needs a value")?.clone();
                i += 2;
            }
            "-x" => {
                params.case_sensitive = true;
                i += 1;
            }
            other => return Err(format!("mkfs: unknown option {other}").into()),
        }
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(image)?;
    file.set_len(size_mb * 1024 * 1024)?;
    hfsvol::format(&mut file, &params)?;
    println!(
        "{GREEN}created{RESET} {image}: \"{}\", {} MB, {} byte blocks",
        params.volume_name, size_mb, params.block_size
    );
    Ok(())
}

fn info(args: &[String]) -> ToolResult {
    let image = args.first().ok_or("info: missing image path")?;
    let vol = open_volume(image)?;
    let vcb = vol.vcb();

    section("Volume");
    kv("name", vol.volume_name());
    kv(
        "format",
        if vcb.is_standard {
            "HFS (standard)"
        } else if vcb.is_hfsx {
            "HFSX (case-sensitive)"
        } else {
            "HFS+"
        },
    );
    kv("block size", &format!("{}", vcb.block_size));
    kv("total blocks", &format!("{}", vcb.total_blocks));
    kv("free blocks", &format!("{}", vcb.free_blocks));
    kv(
        "capacity",
        &format_size(vcb.total_blocks as u64 * vcb.block_size as u64),
    );
    kv(
        "free",
        &format_size(vcb.free_blocks as u64 * vcb.block_size as u64),
    );
    kv("files", &format!("{}", vcb.file_count));
    kv("folders", &format!("{}", vcb.folder_count));
    kv("next cnid", &format!("{}", vcb.next_catalog_id));
    kv("write count", &format!("{}", vcb.write_count));
    println!();
    Ok(())
}

fn ls(args: &[String]) -> ToolResult {
    let image = args.first().ok_or("ls: missing image path")?;
    let path = args.get(1).map(String::as_str).unwrap_or("/");
    let mut vol = open_volume(image)?;

    let entries = vol.read_dir(path)?;
    for entry in &entries {
        let color = kind_color(entry.kind);
        println!(
            "  {DIM}{}{RESET}  {:>10}  {color}{}{RESET}",
            kind_icon(entry.kind),
            format_size(entry.size),
            entry.name
        );
    }
    println!("  {DIM}{} entries{RESET}", entries.len());
    Ok(())
}

fn tree(args: &[String]) -> ToolResult {
    let image = args.first().ok_or("tree: missing image path")?;
    let path = args.get(1).map(String::as_str).unwrap_or("/");
    let mut vol = open_volume(image)?;
    println!("{BOLD}{path}{RESET}");
    tree_walk(&mut vol, path, "")?;
    Ok(())
}

fn tree_walk(
    vol: &mut Volume<std::fs::File>,
    path: &str,
    prefix: &str,
) -> ToolResult {
    let entries = vol.read_dir(path)?;
    let last = entries.len().saturating_sub(1);
    for (i, entry) in entries.iter().enumerate() {
        let branch = if i == last { ELBOW } else { TEE };
        let color = kind_color(entry.kind);
        println!("{prefix}{branch} {color}{}{RESET}", entry.name);
        if entry.kind == hfsvol::EntryKind::Directory {
            let child_prefix = if i == last {
                format!("{prefix}    ")
            } else {
                format!("{prefix}│   ")
            };
            let child_path = if path.ends_with('/') {
                format!("{path}{}", entry.name)
            } else {
                format!("{path}/{}", entry.name)
            };
            tree_walk(vol, &child_path, &child_prefix)?;
        }
    }
    Ok(())
}

fn cat(args: &[String]) -> ToolResult {
    let image = args.first().ok_or("cat: missing image path")?;
    let path = args.get(1).ok_or("cat: missing file path")?;
    let mut vol = open_volume(image)?;

    let handle = vol.open(path, false)?;
    let stat = vol.stat(path)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut offset = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    while offset < stat.size {
        let n = vol.read(&handle, offset, &mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        offset += n as u64;
    }
    vol.close(handle)?;
    Ok(())
}

fn stat(args: &[String]) -> ToolResult {
    let image = args.first().ok_or("stat: missing image path")?;
    let path = args.get(1).ok_or("stat: missing file path")?;
    let mut vol = open_volume(image)?;
    let st = vol.stat(path)?;

    section(path);
    kv("cnid", &format!("{}", st.cnid));
    kv(
        "kind",
        match st.kind {
            hfsvol::EntryKind::File => "file",
            hfsvol::EntryKind::Directory => "directory",
            hfsvol::EntryKind::Symlink => "symlink",
        },
    );
    kv("size", &format_size(st.size));
    kv("blocks", &format!("{}", st.blocks));
    kv("links", &format!("{}", st.link_count));
    kv("mode", &mode_string(st.permissions.mode));
    kv(
        "owner",
        &format!("{}:{}", st.permissions.owner_id, st.permissions.group_id),
    );
    if st.resource_fork_size > 0 {
        kv("resource fork", &format_size(st.resource_fork_size));
    }
    println!();
    Ok(())
}
