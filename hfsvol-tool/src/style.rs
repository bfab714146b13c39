// ── ANSI styling ─────────────────────────────────────────────────────────

pub(crate) const RESET: &str = "\x1b[0m";
pub(crate) const BOLD: &str = "\x1b[1m";
pub(crate) const DIM: &str = "\x1b[2m";
pub(crate) const GREEN: &str = "\x1b[32m";
pub(crate) const CYAN: &str = "\x1b[36m";
pub(crate) const BLUE: &str = "\x1b[34m";
pub(crate) const RED: &str = "\x1b[31m";
pub(crate) const WHITE: &str = "\x1b[37m";

// ── Box-drawing ──────────────────────────────────────────────────────────

pub(crate) const TEE: &str = "├──";
pub(crate) const ELBOW: &str = "└──";
pub(crate) const DASH_LINE: &str = "────────────────────────────────────────────────────────────";

// ── Formatting ───────────────────────────────────────────────────────────

pub(crate) fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

pub(crate) fn mode_string(mode: u16) -> String {
    let file_type = match mode >> 12 {
        0o12 => 'l',
        0o04 => 'd',
        _ => '-',
    };
    let perms = [
        if mode & 0o400 != 0 { 'r' } else { '-' },
        if mode & 0o200 != 0 { 'w' } else { '-' },
        if mode & 0o100 != 0 { 'x' } else { '-' },
        if mode & 0o040 != 0 { 'r' } else { '-' },
        if mode & 0o020 != 0 { 'w' } else { '-' },
        if mode & 0o010 != 0 { 'x' } else { '-' },
        if mode & 0o004 != 0 { 'r' } else { '-' },
        if mode & 0o002 != 0 { 'w' } else { '-' },
        if mode & 0o001 != 0 { 'x' } else { '-' },
    ];
    format!("{}{}", file_type, perms.iter().collect::<String>())
}

pub(crate) fn kind_icon(kind: hfsvol::EntryKind) -> &'static str {
    match kind {
        hfsvol::EntryKind::Directory => "dir",
        hfsvol::EntryKind::File => "   ",
        hfsvol::EntryKind::Symlink => "lnk",
    }
}

pub(crate) fn kind_color(kind: hfsvol::EntryKind) -> &'static str {
    match kind {
        hfsvol::EntryKind::Directory => BLUE,
        hfsvol::EntryKind::File => WHITE,
        hfsvol::EntryKind::Symlink => CYAN,
    }
}

pub(crate) fn section(title: &str) {
    println!();
    println!("  {CYAN}{BOLD}{title}{RESET}");
    println!("  {DIM}{DASH_LINE}{RESET}");
}

pub(crate) fn kv(key: &str, value: &str) {
    println!("  {DIM}{key:<24}{RESET} {value}");
}
