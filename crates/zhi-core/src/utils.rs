//! Path and string helpers.

use std::path::PathBuf;

/// The zhi data directory (`~/.zhi/`).
pub fn get_data_path() -> PathBuf {
    home_dir().join(".zhi")
}

/// Directory for user-installed skills (`~/.zhi/skills/`).
pub fn get_user_skills_path() -> PathBuf {
    get_data_path().join("skills")
}

/// REPL history file (`~/.zhi/history`).
pub fn get_history_path() -> PathBuf {
    get_data_path().join("history")
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        home_dir()
    } else if let Some(rest) = path.strip_prefix("~/") {
        home_dir().join(rest)
    } else {
        PathBuf::from(path)
    }
}

fn home_dir() -> PathBuf {
    dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Longest prefix of `s` that fits in `max_bytes` without splitting a
/// UTF-8 sequence.
pub fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Truncate to `max_len` characters for display, adding "..." when cut.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

/// Human-readable byte size: `512B`, `3.4KB`, `1.2MB`.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes}B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
