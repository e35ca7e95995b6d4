//! Working-directory detection from terminal escape sequences.
//!
//! Shells with integration enabled announce their cwd in-band. Several
//! dialects exist; they are tried best-first:
//!
//! 1. VSCode shell integration: `ESC ] 633 ; P ; Cwd=PATH BEL`
//! 2. iTerm2: `ESC ] 1337 ; CurrentDir=PATH BEL`
//! 3. OSC 7: `ESC ] 7 ; file://HOST/PATH ST` (percent-encoded)
//! 4. Window title (`ESC ] 0;…` / `ESC ] 2;…`): heuristic — the segment
//!    after the last colon, falling back to any `~/…` or `/…` token.
//!
//! Every candidate must name an existing directory before it is accepted. A
//! sequence that straddles two reads is simply missed; the next announcement
//! (typically the next prompt) repairs the state.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::bytes::Regex;

fn vscode_cwd() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?-u)\x1b\]633;P;Cwd=([^\x07]*)\x07").expect("valid pattern"))
}

fn iterm_current_dir() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?-u)\x1b\]1337;CurrentDir=([^\x07]*)\x07").expect("valid pattern")
    })
}

fn osc7_file_url() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?-u)\x1b\]7;file://[^/\x07\x1b]*(/[^\x07\x1b]*)(?:\x07|\x1b\\)")
            .expect("valid pattern")
    })
}

fn title_sequence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s-u)\x1b\][02];(.*?)(?:\x07|\x1b\\)").expect("valid pattern")
    })
}

/// Cheap screen so the full parsers only run on reads that could possibly
/// carry an announcement.
pub fn has_cwd_hint(data: &[u8]) -> bool {
    data.windows(2).any(|w| w == b"\x1b]")
}

/// Extract the best working-directory announcement in `data`, if any.
pub fn scan_working_dir(data: &[u8]) -> Option<PathBuf> {
    if !has_cwd_hint(data) {
        return None;
    }
    if let Some(caps) = vscode_cwd().captures(data) {
        if let Some(dir) = validate(expand_home(&lossy(&caps[1]))) {
            return Some(dir);
        }
    }
    if let Some(caps) = iterm_current_dir().captures(data) {
        if let Some(dir) = validate(expand_home(&lossy(&caps[1]))) {
            return Some(dir);
        }
    }
    if let Some(caps) = osc7_file_url().captures(data) {
        let decoded = urlencoding::decode_binary(&caps[1]);
        if let Some(dir) = validate(PathBuf::from(lossy(&decoded))) {
            return Some(dir);
        }
    }
    if let Some(caps) = title_sequence().captures(data) {
        if let Some(dir) = parse_title(&lossy(&caps[1])) {
            return Some(dir);
        }
    }
    None
}

/// Display name for a directory: last path component, with the home
/// directory and the filesystem root special-cased.
pub fn derive_name(path: &Path) -> String {
    if let Some(home) = home_dir() {
        if path == home {
            return "home".to_string();
        }
    }
    if path == Path::new("/") {
        return "root".to_string();
    }
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string())
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn parse_title(title: &str) -> Option<PathBuf> {
    // "user@host: ~/src" — the segment after the last colon wins.
    if let Some(idx) = title.rfind(':') {
        let candidate = title[idx + 1..].trim();
        if !candidate.is_empty() {
            if let Some(dir) = validate(expand_home(candidate)) {
                return Some(dir);
            }
        }
    }
    for token in title.split_whitespace() {
        if token.starts_with('/') || token.starts_with("~/") || token == "~" {
            if let Some(dir) = validate(expand_home(token)) {
                return Some(dir);
            }
        }
    }
    None
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn expand_home(raw: &str) -> PathBuf {
    if raw == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from(raw));
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

fn validate(path: PathBuf) -> Option<PathBuf> {
    if path.is_dir() {
        Some(path)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vscode_sequence_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let other = tempfile::tempdir().expect("tempdir");
        let data = format!(
            "noise\x1b]633;P;Cwd={}\x07more\x1b]1337;CurrentDir={}\x07",
            dir.path().display(),
            other.path().display(),
        );
        assert_eq!(scan_working_dir(data.as_bytes()), Some(dir.path().to_path_buf()));
    }

    #[test]
    fn iterm_sequence_parses() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = format!("\x1b]1337;CurrentDir={}\x07", dir.path().display());
        assert_eq!(scan_working_dir(data.as_bytes()), Some(dir.path().to_path_buf()));
    }

    #[test]
    fn osc7_is_percent_decoded() {
        let base = tempfile::tempdir().expect("tempdir");
        let spaced = base.path().join("with space");
        std::fs::create_dir(&spaced).expect("mkdir");
        let encoded = format!(
            "{}/with%20space",
            base.path().display()
        );
        let data = format!("\x1b]7;file://myhost{}\x1b\\", encoded);
        assert_eq!(scan_working_dir(data.as_bytes()), Some(spaced));
    }

    #[test]
    fn title_takes_segment_after_last_colon() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = format!("\x1b]0;user@host: {}\x07", dir.path().display());
        assert_eq!(scan_working_dir(data.as_bytes()), Some(dir.path().to_path_buf()));
    }

    #[test]
    fn title_falls_back_to_path_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = format!("\x1b]2;editing in {} now\x07", dir.path().display());
        assert_eq!(scan_working_dir(data.as_bytes()), Some(dir.path().to_path_buf()));
    }

    #[test]
    fn nonexistent_directories_are_rejected() {
        let data = b"\x1b]633;P;Cwd=/definitely/not/a/real/dir\x07";
        assert_eq!(scan_working_dir(data), None);
    }

    #[test]
    fn plain_output_has_no_hint() {
        assert!(!has_cwd_hint(b"ls -la\r\n"));
        assert_eq!(scan_working_dir(b"ls -la\r\n"), None);
    }

    #[test]
    fn name_derivation() {
        assert_eq!(derive_name(Path::new("/tmp")), "tmp");
        assert_eq!(derive_name(Path::new("/")), "root");
        assert_eq!(derive_name(Path::new("/a/b/c")), "c");
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(derive_name(Path::new(&home)), "home");
        }
    }
}
