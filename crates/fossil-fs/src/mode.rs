//! Mode strings.
//!
//! A mode prints as an optional run of flag characters followed by octal
//! permission bits, e.g. `d0755` for a directory. The characters map 1:1
//! onto the high mode bits.

use fossil_types::{
    MODE_APPEND, MODE_ARCHIVE, MODE_DIR, MODE_EXCLUSIVE, MODE_HIDDEN, MODE_LINK, MODE_PERM_MASK,
    MODE_SETGID, MODE_SETUID, MODE_SNAPSHOT, MODE_STICKY, MODE_SYSTEM, MODE_TEMPORARY,
};

const MODE_CHARS: &[u8] = b"YUGalLdHSATs";

const MODE_BITS: [u32; 12] = [
    MODE_STICKY,
    MODE_SETUID,
    MODE_SETGID,
    MODE_APPEND,
    MODE_EXCLUSIVE,
    MODE_LINK,
    MODE_DIR,
    MODE_HIDDEN,
    MODE_SYSTEM,
    MODE_ARCHIVE,
    MODE_TEMPORARY,
    MODE_SNAPSHOT,
];

/// Print a mode as flag characters plus octal permissions.
#[must_use]
pub fn mode_string(mode: u32) -> String {
    let mut out = String::new();
    for (i, bit) in MODE_BITS.iter().enumerate() {
        if mode & bit != 0 {
            out.push(MODE_CHARS[i] as char);
        }
    }
    out.push_str(&format!("{:04o}", mode & MODE_PERM_MASK));
    out
}

/// Parse a mode string; `None` for anything malformed or with bits outside
/// the representable set.
#[must_use]
pub fn parse_mode(s: &str) -> Option<u32> {
    let mut mode = 0_u32;
    let mut rest = s;
    loop {
        let c = *rest.as_bytes().first()?;
        if c.is_ascii_digit() {
            break;
        }
        let i = MODE_CHARS.iter().position(|m| *m == c)?;
        mode |= MODE_BITS[i];
        rest = &rest[1..];
    }
    let perm = u32::from_str_radix(rest, 8).ok()?;
    if perm > 0o777 {
        return None;
    }
    Some(mode | perm)
}
