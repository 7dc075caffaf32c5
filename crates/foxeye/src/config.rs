//! Registered configuration variables.
//!
//! The core owns a registry of typed variables; startup feeds it with
//! `set <name> <value>` directives from the config file and modules
//! re-announce their variables on `Signal::Reg`. Three value shapes exist:
//! strings, integers, and the tri-state booleans (`yes`, `no`, `ask-yes`,
//! `ask-no`) the DCC policies use.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::warn;
use winnow::ascii::{space0, space1};
use winnow::combinator::{alt, delimited};
use winnow::error::ContextError;
use winnow::prelude::*;
use winnow::token::{rest, take_while};

/// Result type for winnow parsers.
pub type PResult<T> = Result<T, winnow::error::ErrMode<ContextError>>;

/// A `yes`/`no` with an optional "ask the user first" bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriBool {
    pub value: bool,
    pub ask: bool,
}

impl TriBool {
    pub const YES: TriBool = TriBool { value: true, ask: false };
    pub const NO: TriBool = TriBool { value: false, ask: false };
    pub const ASK_YES: TriBool = TriBool { value: true, ask: true };
    pub const ASK_NO: TriBool = TriBool { value: false, ask: true };

    /// The default answer when no UI is attached to confirm.
    pub fn resolve(self) -> bool {
        self.value
    }

    pub fn parse_str(s: &str) -> Option<TriBool> {
        match s {
            "yes" | "on" | "true" => Some(TriBool::YES),
            "no" | "off" | "false" => Some(TriBool::NO),
            "ask-yes" | "ask" => Some(TriBool::ASK_YES),
            "ask-no" => Some(TriBool::ASK_NO),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Int(i64),
    Tri(TriBool),
}

/// The variable registry.
pub struct Settings {
    vars: Mutex<BTreeMap<String, Value>>,
}

impl Settings {
    pub fn new() -> Settings {
        Settings { vars: Mutex::new(BTreeMap::new()) }
    }

    /// Registry preloaded with every directive the core consumes.
    pub fn with_core_defaults() -> Settings {
        let s = Settings::new();
        s.register_str("nick", "");
        s.register_str("incoming-path", "~/.foxeye/files");
        s.register_int("dcc-ahead", 0);
        s.register_int("dcc-connection-timeout", 60);
        s.register_int("dcc-resume-timeout", 30);
        s.register_int("dcc-resume-min", 10000);
        s.register_int("dcc-get-maxsize", 1_000_000_000);
        s.register_int("dcc-blocksize", 2048);
        s.register_int("dcc-timeout", 60);
        s.register_int("ident-timeout", 60);
        s.register_int("listen-port", 0);
        s.register_str("dcc-port-range", "");
        s.register_tri("dcc-allow-ctcp-chat", TriBool::YES);
        s.register_tri("dcc-allow-resume", TriBool::YES);
        s.register_tri("dcc-resume", TriBool::YES);
        s.register_tri("dcc-get", TriBool::YES);
        s.register_tri("dcc-accept-chat", TriBool::ASK_YES);
        s.register_tri("dcc-get-overwrite", TriBool::NO);
        s.register_tri("drop-unknown", TriBool::NO);
        s.register_tri("strict-backresolve", TriBool::NO);
        s.register_str("ssl-certificate-file", "");
        s.register_str("ssl-key-file", "");
        s.register_tri("ssl-enable-server-bypass", TriBool::NO);
        s
    }

    pub fn register_str(&self, name: &str, default: &str) {
        self.vars
            .lock()
            .unwrap()
            .entry(name.to_owned())
            .or_insert_with(|| Value::Str(default.to_owned()));
    }

    pub fn register_int(&self, name: &str, default: i64) {
        self.vars.lock().unwrap().entry(name.to_owned()).or_insert(Value::Int(default));
    }

    pub fn register_tri(&self, name: &str, default: TriBool) {
        self.vars.lock().unwrap().entry(name.to_owned()).or_insert(Value::Tri(default));
    }

    pub fn get_str(&self, name: &str) -> String {
        match self.vars.lock().unwrap().get(name) {
            Some(Value::Str(s)) => s.clone(),
            Some(Value::Int(i)) => i.to_string(),
            _ => String::new(),
        }
    }

    pub fn get_int(&self, name: &str) -> i64 {
        match self.vars.lock().unwrap().get(name) {
            Some(Value::Int(i)) => *i,
            Some(Value::Str(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn get_tri(&self, name: &str) -> TriBool {
        match self.vars.lock().unwrap().get(name) {
            Some(Value::Tri(t)) => *t,
            _ => TriBool::NO,
        }
    }

    pub fn get_bool(&self, name: &str) -> bool {
        self.get_tri(name).resolve()
    }

    /// Overwrite a variable from text, keeping its registered shape.
    pub fn set(&self, name: &str, raw: &str) -> bool {
        let mut vars = self.vars.lock().unwrap();
        match vars.get_mut(name) {
            Some(Value::Str(s)) => {
                *s = raw.to_owned();
                true
            }
            Some(Value::Int(i)) => match raw.parse() {
                Ok(v) => {
                    *i = v;
                    true
                }
                Err(_) => false,
            },
            Some(Value::Tri(t)) => match TriBool::parse_str(raw) {
                Some(v) => {
                    *t = v;
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Apply one config line. Unknown directives are warned about and
    /// skipped; comments and blank lines are fine.
    pub fn apply_line(&self, line: &str) -> bool {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return true;
        }
        match parse_set.parse(trimmed) {
            Ok((name, value)) => {
                if !self.set(name, value.as_str()) {
                    warn!(name, value, "config: bad or unknown directive value");
                    return false;
                }
                true
            }
            Err(_) => {
                warn!(line = trimmed, "config: unparsable directive");
                false
            }
        }
    }

    /// Apply a whole config file body. Returns the count of bad lines.
    pub fn apply(&self, body: &str) -> usize {
        body.lines().filter(|l| !self.apply_line(l)).count()
    }

    /// Emit `set` directives for every variable, for `-g` config output.
    pub fn dump(&self) -> String {
        let vars = self.vars.lock().unwrap();
        let mut out = String::new();
        for (name, value) in vars.iter() {
            match value {
                Value::Str(s) => out.push_str(&format!("set {} \"{}\"\n", name, s)),
                Value::Int(i) => out.push_str(&format!("set {} {}\n", name, i)),
                Value::Tri(t) => {
                    let word = match (t.ask, t.value) {
                        (false, true) => "yes",
                        (false, false) => "no",
                        (true, true) => "ask-yes",
                        (true, false) => "ask-no",
                    };
                    out.push_str(&format!("set {} {}\n", name, word));
                }
            }
        }
        out
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::new()
    }
}

fn word<'a>(input: &mut &'a str) -> PResult<&'a str> {
    take_while(1.., |c: char| !c.is_whitespace()).parse_next(input)
}

fn value(input: &mut &str) -> PResult<String> {
    alt((
        delimited('"', take_while(0.., |c: char| c != '"'), '"').map(str::to_owned),
        rest.map(|s: &str| s.trim_end().to_owned()),
    ))
    .parse_next(input)
}

/// `set <name> <value>` with optional quoting.
fn parse_set<'a>(input: &mut &'a str) -> PResult<(&'a str, String)> {
    let _ = "set".parse_next(input)?;
    let _ = space1.parse_next(input)?;
    let name = word.parse_next(input)?;
    let _ = space1.parse_next(input)?;
    let v = value.parse_next(input)?;
    let _ = space0.parse_next(input)?;
    Ok((name, v))
}

/// Split a `LANG`-style value (`uk_UA.KOI8-U`) into locale and charset.
pub fn split_lang(lang: &str) -> (&str, Option<&str>) {
    match lang.split_once('.') {
        Some((locale, charset)) => (locale, Some(charset)),
        None => (lang, None),
    }
}

/// Parse a `dcc-port-range` value like `"1024 - 65535"`. Zeroes mean
/// "let the system pick"; a floor of 1024 is enforced otherwise.
pub fn parse_port_range(raw: &str) -> (u16, u16) {
    let mut parts = raw.split('-').map(str::trim);
    let start: u16 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let end: u16 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(start);
    if start == 0 && end == 0 {
        return (0, 0);
    }
    let start = start.max(1024);
    let end = end.max(start);
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_defaults() {
        let s = Settings::with_core_defaults();
        assert_eq!(s.get_int("dcc-blocksize"), 2048);
        assert_eq!(s.get_tri("dcc-accept-chat"), TriBool::ASK_YES);
        assert_eq!(s.get_str("incoming-path"), "~/.foxeye/files");
    }

    #[test]
    fn test_apply_quoted_string() {
        let s = Settings::with_core_defaults();
        assert!(s.apply_line("set nick \"foxeye\""));
        assert_eq!(s.get_str("nick"), "foxeye");
    }

    #[test]
    fn test_apply_int_and_tri() {
        let s = Settings::with_core_defaults();
        assert!(s.apply_line("set dcc-ahead 4"));
        assert_eq!(s.get_int("dcc-ahead"), 4);
        assert!(s.apply_line("set dcc-get-overwrite ask-no"));
        assert_eq!(s.get_tri("dcc-get-overwrite"), TriBool::ASK_NO);
        assert!(!s.apply_line("set dcc-ahead notanumber"));
    }

    #[test]
    fn test_comments_and_unknowns() {
        let s = Settings::with_core_defaults();
        assert!(s.apply_line("# just a comment"));
        assert!(s.apply_line("   "));
        assert!(!s.apply_line("set no-such-var 1"));
    }

    #[test]
    fn test_dump_roundtrip() {
        let s = Settings::with_core_defaults();
        s.apply_line("set nick \"test\"");
        let dump = s.dump();
        let s2 = Settings::with_core_defaults();
        assert_eq!(s2.apply(&dump), 0);
        assert_eq!(s2.get_str("nick"), "test");
    }

    #[test]
    fn test_split_lang() {
        assert_eq!(split_lang("uk_UA.KOI8-U"), ("uk_UA", Some("KOI8-U")));
        assert_eq!(split_lang("C"), ("C", None));
    }

    #[test]
    fn test_port_range() {
        assert_eq!(parse_port_range(""), (0, 0));
        assert_eq!(parse_port_range("2000 - 3000"), (2000, 3000));
        assert_eq!(parse_port_range("100 - 200"), (1024, 1024));
        assert_eq!(parse_port_range("5000"), (5000, 5000));
    }
}
