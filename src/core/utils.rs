//! Small filesystem / formatting helpers used across the download pipeline.

use std::path::Path;

/// Maximum file-name length in bytes, leaving headroom for most filesystems.
const MAX_FILE_NAME_BYTES: usize = 240;

/// Strips characters that are not safe in file and directory names.
///
/// Mirrors what the save-path builder expects: path separators and shell
/// metacharacters are replaced with a space, runs of whitespace collapse.
pub fn validate_title(title: &str) -> String {
    let mut cleaned = String::with_capacity(title.len());
    for c in title.chars() {
        match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\u{0}'..='\u{1f}' => cleaned.push(' '),
            _ => cleaned.push(c),
        }
    }
    let collapsed: Vec<&str> = cleaned.split_whitespace().collect();
    collapsed.join(" ")
}

/// Truncates a file name to a safe byte length while preserving its extension.
///
/// Paths are truncated on the final component only; UTF-8 boundaries are
/// respected so the result is always a valid string.
pub fn truncate_filename(path: &str) -> String {
    let p = Path::new(path);
    let file_name = match p.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return path.to_string(),
    };
    if file_name.len() <= MAX_FILE_NAME_BYTES {
        return path.to_string();
    }

    let (stem, ext) = match file_name.rfind('.') {
        Some(idx) => (&file_name[..idx], &file_name[idx..]),
        None => (file_name, ""),
    };
    let budget = MAX_FILE_NAME_BYTES.saturating_sub(ext.len());
    let mut cut = budget.min(stem.len());
    while cut > 0 && !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    let truncated = format!("{}{}", &stem[..cut], ext);

    match p.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(truncated).to_string_lossy().into_owned(),
        _ => truncated,
    }
}

/// Formats a byte count as a human readable string.
pub fn format_byte(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// Expands a leading tilde and returns an absolute-ish path string.
pub fn expand_path(path: &str) -> String {
    shellexpand::tilde(path).into_owned()
}
