//! Terminal escape stripping for console output.
//!
//! Guest consoles interleave the text we match against with ANSI control
//! sequences (colors, cursor movement, terminal title updates). Patterns
//! are written as plain text, so everything non-printable is removed
//! before matching.

/// Remove ANSI escape sequences and stray control bytes from `raw`.
///
/// Covers the sequence families a Linux guest actually emits on a serial
/// console: CSI (`ESC [`), OSC (`ESC ]`, ended by BEL or ST), DCS
/// (`ESC P`, ended by ST), charset selection (`ESC (` / `ESC )`) and
/// two-byte `ESC x` forms. BEL, NUL, SI and SO outside a sequence are
/// dropped as well. Unknown escapes lose only the ESC byte.
pub fn strip_ansi(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            0x1b => i += skip_escape(&bytes[i..]),
            0x07 | 0x00 | 0x0e | 0x0f => i += 1,
            b if b < 0x80 => {
                out.push(b as char);
                i += 1;
            }
            b => {
                // Re-slice on char boundaries so multibyte output survives.
                let ch_len = char_len(b);
                if let Ok(s) = std::str::from_utf8(&bytes[i..(i + ch_len).min(bytes.len())]) {
                    out.push_str(s);
                }
                i += ch_len;
            }
        }
    }
    out
}

/// Length in bytes of the escape sequence starting at `bytes[0]` (the ESC).
fn skip_escape(bytes: &[u8]) -> usize {
    match bytes.get(1) {
        Some(b'[') => 2 + csi_body_len(&bytes[2..]),
        Some(b']') => 2 + string_body_len(&bytes[2..], true),
        Some(b'P') => 2 + string_body_len(&bytes[2..], false),
        // Charset selection carries one designator byte after the paren.
        Some(b'(') | Some(b')') => if bytes.len() > 2 { 3 } else { 2 },
        Some(c) if c.is_ascii_alphabetic() || *c == b'>' || *c == b'=' => 2,
        _ => 1,
    }
}

/// CSI parameters and intermediates run until a final byte in 0x40..=0x7e.
fn csi_body_len(body: &[u8]) -> usize {
    for (n, b) in body.iter().enumerate() {
        if (0x40..=0x7e).contains(b) {
            return n + 1;
        }
    }
    body.len()
}

/// OSC/DCS bodies run until ST (`ESC \`); OSC also accepts BEL.
fn string_body_len(body: &[u8], bel_terminates: bool) -> usize {
    let mut n = 0;
    while n < body.len() {
        if bel_terminates && body[n] == 0x07 {
            return n + 1;
        }
        if body[n] == 0x1b && body.get(n + 1) == Some(&b'\\') {
            return n + 2;
        }
        n += 1;
    }
    body.len()
}

fn char_len(first: u8) -> usize {
    match first {
        b if b < 0x80 => 1,
        b if b & 0xe0 == 0xc0 => 2,
        b if b & 0xf0 == 0xe0 => 3,
        _ => 4,
    }
}
