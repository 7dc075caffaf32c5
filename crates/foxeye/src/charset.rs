//! Charset conversion handles.
//!
//! Internal text is UTF-8. A [`Conversion`] maps it to and from one
//! external charset; interfaces that talk to the outside world hold a
//! handle and the dispatcher consults it when materializing per-interface
//! request payloads. No handle (`None`) is the identity conversion.

use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use encoding_rs::Encoding;
use tracing::debug;

/// Charset used when the configured internal charset is unknown.
pub const CHARSET_8BIT: &str = "windows-1252";

/// A reference-counted conversion between the internal text and one
/// external charset. Clone the `Arc` to share it; the registry hands out
/// one instance per charset label so handle identity equals charset
/// identity.
pub struct Conversion {
    encoding: &'static Encoding,
    /// Replacement for unmappable output characters; `None` drops them.
    replace: Option<char>,
}

impl Conversion {
    /// Charset label of this handle.
    pub fn charset(&self) -> &'static str {
        self.encoding.name()
    }

    /// Encode internal text for the wire.
    pub fn encode(&self, text: &str) -> Bytes {
        if self.encoding == encoding_rs::UTF_8 {
            return Bytes::copy_from_slice(text.as_bytes());
        }
        let (out, _, had_errors) = self.encoding.encode(text);
        if had_errors && self.replace.is_none() {
            // strip what the target charset cannot carry
            let filtered: String = text
                .chars()
                .filter(|&c| {
                    let mut b = [0u8; 4];
                    let (enc, _, err) = self.encoding.encode(c.encode_utf8(&mut b));
                    !err && !enc.is_empty()
                })
                .collect();
            let (out, _, _) = self.encoding.encode(&filtered);
            return Bytes::copy_from_slice(&out);
        }
        Bytes::copy_from_slice(&out)
    }

    /// Decode wire bytes into internal text.
    pub fn decode(&self, raw: &[u8]) -> String {
        let (out, _, _) = self.encoding.decode(raw);
        out.into_owned()
    }

    /// True when both handles are the same charset (used to share one
    /// converted request copy between interfaces).
    pub fn same_as(a: &Option<Arc<Conversion>>, b: &Option<Arc<Conversion>>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(x), Some(y)) => Arc::ptr_eq(x, y),
            _ => false,
        }
    }
}

struct Registry {
    entries: Vec<(String, Arc<Conversion>)>,
    replace: Option<char>,
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| Mutex::new(Registry { entries: Vec::new(), replace: None }))
}

/// Set the replacement character for unmappable output, `None` = drop.
pub fn set_replace_char(c: Option<char>) {
    registry().lock().unwrap().replace = c;
}

/// Find or create the handle for a charset label.
///
/// Returns `None` for an unknown label and for the identity case (the
/// label names UTF-8 itself), matching the "null handle is identity" rule.
pub fn get_conversion(charset: &str) -> Option<Arc<Conversion>> {
    let encoding = Encoding::for_label(charset.as_bytes())?;
    if encoding == encoding_rs::UTF_8 {
        return None;
    }
    let mut reg = registry().lock().unwrap();
    if let Some((_, conv)) = reg
        .entries
        .iter()
        .find(|(label, _)| label.eq_ignore_ascii_case(charset))
    {
        return Some(conv.clone());
    }
    let conv = Arc::new(Conversion { encoding, replace: reg.replace });
    debug!(charset, canonical = conv.charset(), "charset: new conversion");
    reg.entries.push((charset.to_owned(), conv.clone()));
    Some(conv)
}

/// Pick the startup charset from a `LANG`-style value, falling back to an
/// 8-bit codepage when the label is unknown.
pub fn startup_charset(lang_charset: &str) -> &'static str {
    match Encoding::for_label(lang_charset.as_bytes()) {
        Some(e) => e.name(),
        None => {
            debug!(lang_charset, "charset: unknown, falling back to {CHARSET_8BIT}");
            Encoding::for_label(CHARSET_8BIT.as_bytes()).unwrap().name()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_none() {
        assert!(get_conversion("utf-8").is_none());
        assert!(get_conversion("UTF-8").is_none());
        assert!(get_conversion("no-such-charset").is_none());
    }

    #[test]
    fn test_handles_are_shared() {
        let a = get_conversion("koi8-r").unwrap();
        let b = get_conversion("KOI8-R").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Conversion::same_as(&Some(a), &Some(b)));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let conv = get_conversion("koi8-r").unwrap();
        let wire = conv.encode("привет");
        assert_eq!(wire.len(), 6); // single byte per char in koi8-r
        assert_eq!(conv.decode(&wire), "привет");
    }

    #[test]
    fn test_startup_fallback() {
        assert_eq!(startup_charset("UTF-8"), "UTF-8");
        let fb = startup_charset("X-BOGUS-42");
        assert_eq!(fb, "windows-1252");
    }
}
