//! Terminal auto-response scrubbing.
//!
//! Replayed scrollback often contains the *answers* a terminal emulator gave
//! to in-band queries — device attribute reports, cursor position reports,
//! OSC color readbacks. Feeding those answers back to a fresh emulator (or,
//! on the client side, letting a replaying emulator's own answers reach the
//! PTY) corrupts whatever program is attached. Four families are stripped:
//!
//! 1. OSC 10/11 color responses (`ESC ] 10;… BEL` / `ESC \`).
//! 2. Device-attribute responses (`ESC [ ? … c`, `ESC [ > … c`).
//! 3. Cursor position reports (`ESC [ n;m R`).
//! 4. The query forms emulators echo during replay: primary/secondary DA,
//!    DSR-6, kitty keyboard, DECRQM, XTVERSION, focus-reporting toggles, and
//!    OSC 10/11 color queries.
//!
//! A malformed OSC (no terminator inside the chunk) is left alone — the
//! introducer byte stays and scanning continues.

use std::sync::OnceLock;

use regex::bytes::Regex;

use crate::buffer::Chunk;

fn osc_color_responses() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // (?s-u): the payload is raw bytes, not UTF-8.
        Regex::new(r"(?s-u)\x1b\] *1[01];.*?(?:\x07|\x1b\\)").expect("valid pattern")
    })
}

fn device_attribute_responses() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[?>][0-9;]*c").expect("valid pattern"))
}

fn cursor_position_reports() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9]+;[0-9]+R").expect("valid pattern"))
}

fn terminal_queries() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            \x1b\[c                                 # primary DA
          | \x1b\[>[0-9]*c                          # secondary DA
          | \x1b\[6n                                # DSR-6 cursor position
          | \x1b\[\?[0-9]*u                         # kitty keyboard protocol
          | \x1b\[\?[0-9]+(?:;[0-9]+)*\$p           # DECRQM request mode
          | \x1b\[>[0-9]*q                          # XTVERSION
          | \x1b\[\?1004[hl]                        # focus reporting toggle
          | \x1b\]1[01];\?(?:\x07|\x1b\\)           # OSC 10/11 color query
        ",
        )
        .expect("valid pattern")
    })
}

fn run_passes(data: &[u8]) -> Vec<u8> {
    let pass1 = osc_color_responses().replace_all(data, &b""[..]);
    let pass2 = device_attribute_responses().replace_all(&pass1, &b""[..]);
    let pass3 = cursor_position_reports().replace_all(&pass2, &b""[..]);
    terminal_queries().replace_all(&pass3, &b""[..]).into_owned()
}

/// Strip every recognized auto-response sequence from `data`.
///
/// Removing a span can splice the bytes around it into a fresh match (an ESC
/// rejoining a tail), so the passes repeat until nothing changes. The result
/// is a fixed point: filtering twice equals filtering once.
pub fn scrub_auto_responses(data: &[u8]) -> Vec<u8> {
    let mut current = run_passes(data);
    loop {
        let next = run_passes(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Filter a replay batch. Chunks emptied by scrubbing are dropped entirely;
/// chunks that were empty to begin with pass through unchanged.
pub fn filter_chunks(chunks: Vec<Chunk>) -> Vec<Chunk> {
    chunks
        .into_iter()
        .filter_map(|chunk| {
            if chunk.data.is_empty() {
                return Some(chunk);
            }
            let data = scrub_auto_responses(&chunk.data);
            if data.is_empty() {
                None
            } else {
                Some(Chunk { data, ..chunk })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scrub_str(s: &str) -> Vec<u8> {
        scrub_auto_responses(s.as_bytes())
    }

    #[test]
    fn strips_color_response_and_da_response() {
        let out = scrub_str("hello\x1b]10;rgb:1/2/3\x07world\x1b[?1;2c");
        assert_eq!(out, b"helloworld");
    }

    #[test]
    fn strips_osc_11_with_st_terminator() {
        let out = scrub_str("a\x1b]11;rgb:00/00/00\x1b\\b");
        assert_eq!(out, b"ab");
    }

    #[test]
    fn strips_osc_with_leading_spaces() {
        let out = scrub_str("x\x1b] 10;anything\x07y");
        assert_eq!(out, b"xy");
    }

    #[test]
    fn malformed_osc_without_terminator_is_kept() {
        let input = "keep\x1b]10;rgb:1/2/3 no terminator";
        assert_eq!(scrub_str(input), input.as_bytes());
    }

    #[test]
    fn strips_secondary_da_response() {
        assert_eq!(scrub_str("a\x1b[>41;354;0cb"), b"ab");
    }

    #[test]
    fn strips_cursor_position_report() {
        assert_eq!(scrub_str("a\x1b[12;40Rb"), b"ab");
    }

    #[test]
    fn cursor_report_requires_both_params() {
        let input = "a\x1b[12Rb";
        assert_eq!(scrub_str(input), input.as_bytes());
    }

    #[test]
    fn strips_query_family() {
        assert_eq!(scrub_str("a\x1b[cb"), b"ab");
        assert_eq!(scrub_str("a\x1b[>0cb"), b"ab");
        assert_eq!(scrub_str("a\x1b[6nb"), b"ab");
        assert_eq!(scrub_str("a\x1b[?ub"), b"ab");
        assert_eq!(scrub_str("a\x1b[?1ub"), b"ab");
        assert_eq!(scrub_str("a\x1b[?2026$pb"), b"ab");
        assert_eq!(scrub_str("a\x1b[?2026;1$pb"), b"ab");
        assert_eq!(scrub_str("a\x1b[>qb"), b"ab");
        assert_eq!(scrub_str("a\x1b[?1004hb"), b"ab");
        assert_eq!(scrub_str("a\x1b[?1004lb"), b"ab");
        assert_eq!(scrub_str("a\x1b]10;?\x07b"), b"ab");
        assert_eq!(scrub_str("a\x1b]11;?\x1b\\b"), b"ab");
    }

    #[test]
    fn plain_output_is_untouched() {
        let input = "ls -la\r\n\x1b[1;32mdrwxr-xr-x\x1b[0m src\r\n";
        assert_eq!(scrub_str(input), input.as_bytes());
    }

    #[test]
    fn emptied_chunks_are_dropped_but_empty_ones_pass() {
        let chunks = vec![
            Chunk { sequence: 1, timestamp_ms: 0, data: b"\x1b[?1;2c".to_vec() },
            Chunk { sequence: 2, timestamp_ms: 0, data: Vec::new() },
            Chunk { sequence: 3, timestamp_ms: 0, data: b"text".to_vec() },
        ];
        let out = filter_chunks(chunks);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].sequence, 2);
        assert!(out[0].data.is_empty());
        assert_eq!(out[1].sequence, 3);
        assert_eq!(out[1].data, b"text");
    }

    proptest! {
        #[test]
        fn scrub_is_idempotent(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let once = scrub_auto_responses(&data);
            let twice = scrub_auto_responses(&once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn chunk_filter_is_idempotent(datas in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..64), 0..8,
        )) {
            let chunks: Vec<Chunk> = datas
                .into_iter()
                .enumerate()
                .map(|(i, data)| Chunk { sequence: i as i64 + 1, timestamp_ms: 0, data })
                .collect();
            let once = filter_chunks(chunks);
            let twice = filter_chunks(once.clone());
            prop_assert_eq!(once, twice);
        }
    }
}
