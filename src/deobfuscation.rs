//! Obfuscated filename detection.
//!
//! Drives the `FileNaming=auto` decision: a filename read from article
//! headers replaces the NZB-declared one only when it does not look
//! obfuscated. The heuristic's exact boundary is part of the observable
//! contract and is preserved as-is, quirks included. In particular, a
//! name with an ordinary extension is never "obfuscated" under the
//! alphanumeric branch because the dot fails the character test.

/// Whether a filename looks obfuscated.
///
/// Two accepted shapes:
/// - `abc.xyz.<hex digits>` up to the next dot or end of string
///   (a well-known obfuscation scheme carrying its payload id in hex)
/// - a string made of ASCII alphanumerics only, with no separators at all
pub fn is_obfuscated(name: &str) -> bool {
    if let Some(rest) = name.strip_prefix("abc.xyz.") {
        for c in rest.chars() {
            if c == '.' {
                break;
            }
            if !c.is_ascii_hexdigit() {
                return false;
            }
        }
        true
    } else {
        name.chars().all(|c| c.is_ascii_alphanumeric())
    }
}
