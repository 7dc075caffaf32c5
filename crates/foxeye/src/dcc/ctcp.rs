//! DCC CTCP message grammar.
//!
//! Wire lines interoperate bit-exactly with mIRC-style DCC: IPv4
//! addresses travel as host-order decimal integers, file names may be
//! quoted, a trailing token marks passive negotiation, and `port 0`
//! means "you connect to me".

use winnow::ascii::{digit1, space1};
use winnow::combinator::{alt, delimited, opt, preceded};
use winnow::error::ContextError;
use winnow::prelude::*;
use winnow::token::take_while;

type PResult<T> = Result<T, winnow::error::ErrMode<ContextError>>;

/// A parsed `DCC …` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DccMsg {
    Chat {
        ip: u32,
        port: u16,
    },
    Send {
        name: String,
        ip: u32,
        port: u16,
        size: u64,
        token: Option<u32>,
    },
    Resume {
        name: String,
        port: u16,
        offset: u64,
        token: Option<u32>,
    },
    Accept {
        name: String,
        port: u16,
        offset: u64,
        token: Option<u32>,
    },
}

fn number<T>(input: &mut &str) -> PResult<T>
where
    T: std::str::FromStr,
    <T as std::str::FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
    digit1
        .try_map(str::parse::<T>)
        .parse_next(input)
}

fn file_name(input: &mut &str) -> PResult<String> {
    alt((
        delimited('"', take_while(0.., |c: char| c != '"'), '"').map(str::to_owned),
        take_while(1.., |c: char| !c.is_whitespace()).map(str::to_owned),
    ))
    .parse_next(input)
}

fn chat(input: &mut &str) -> PResult<DccMsg> {
    let _ = "CHAT".parse_next(input)?;
    let _ = space1.parse_next(input)?;
    let _proto = file_name.parse_next(input)?; // usually the word "chat"
    let _ = space1.parse_next(input)?;
    let ip = number::<u32>.parse_next(input)?;
    let _ = space1.parse_next(input)?;
    let port = number::<u16>.parse_next(input)?;
    Ok(DccMsg::Chat { ip, port })
}

fn send(input: &mut &str) -> PResult<DccMsg> {
    let _ = "SEND".parse_next(input)?;
    let _ = space1.parse_next(input)?;
    let name = file_name.parse_next(input)?;
    let _ = space1.parse_next(input)?;
    let ip = number::<u32>.parse_next(input)?;
    let _ = space1.parse_next(input)?;
    let port = number::<u16>.parse_next(input)?;
    let _ = space1.parse_next(input)?;
    let size = number::<u64>.parse_next(input)?;
    let token = opt(preceded(space1, number::<u32>)).parse_next(input)?;
    Ok(DccMsg::Send { name, ip, port, size, token })
}

fn resume_or_accept(input: &mut &str) -> PResult<DccMsg> {
    let verb = alt(("RESUME", "ACCEPT")).parse_next(input)?;
    let _ = space1.parse_next(input)?;
    let name = file_name.parse_next(input)?;
    let _ = space1.parse_next(input)?;
    let port = number::<u16>.parse_next(input)?;
    let _ = space1.parse_next(input)?;
    let offset = number::<u64>.parse_next(input)?;
    let token = opt(preceded(space1, number::<u32>)).parse_next(input)?;
    Ok(if verb == "RESUME" {
        DccMsg::Resume { name, port, offset, token }
    } else {
        DccMsg::Accept { name, port, offset, token }
    })
}

/// Parse the payload of a `DCC` CTCP (without the leading `DCC `).
pub fn parse_dcc(line: &str) -> Option<DccMsg> {
    let line = line.strip_prefix("DCC ").unwrap_or(line);
    alt((chat, send, resume_or_accept)).parse(line.trim()).ok()
}

/// `DCC CHAT chat <ip> <port>`
pub fn format_chat(ip: u32, port: u16) -> String {
    format!("DCC CHAT chat {ip} {port}")
}

/// `DCC SEND "<name>" <ip> <port> <size> [<token>]` — token present iff
/// passive; `port 0` is the passive offer itself.
pub fn format_send(name: &str, ip: u32, port: u16, size: u64, token: Option<u32>) -> String {
    match token {
        Some(t) => format!("DCC SEND \"{name}\" {ip} {port} {size} {t}"),
        None => format!("DCC SEND \"{name}\" {ip} {port} {size}"),
    }
}

/// `DCC RESUME <name> <port> <offset>` or the passive form with a token.
/// The name is always the placeholder `file.ext`, as the other side
/// ignores it anyway.
pub fn format_resume(port: u16, offset: u64, token: Option<u32>) -> String {
    match token {
        Some(t) => format!("DCC RESUME file.ext 0 {offset} {t}"),
        None => format!("DCC RESUME file.ext {port} {offset}"),
    }
}

/// `DCC ACCEPT` counterpart of [`format_resume`].
pub fn format_accept(name: &str, port: u16, offset: u64, token: Option<u32>) -> String {
    match token {
        Some(t) => format!("DCC ACCEPT \"{name}\" 0 {offset} {t}"),
        None => format!("DCC ACCEPT \"{name}\" {port} {offset}"),
    }
}

/// Render a host-order IPv4 integer as dotted quad.
pub fn ip_to_string(ip: u32) -> String {
    std::net::Ipv4Addr::from(ip).to_string()
}

/// Parse a dotted quad into the host-order integer the wire format wants.
pub fn string_to_ip(s: &str) -> Option<u32> {
    s.parse::<std::net::Ipv4Addr>().ok().map(u32::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat() {
        assert_eq!(
            parse_dcc("DCC CHAT chat 2130706433 40000"),
            Some(DccMsg::Chat { ip: 2130706433, port: 40000 })
        );
    }

    #[test]
    fn test_parse_send_active() {
        assert_eq!(
            parse_dcc("DCC SEND \"a\" 2130706433 40000 3"),
            Some(DccMsg::Send {
                name: "a".into(),
                ip: 2130706433,
                port: 40000,
                size: 3,
                token: None
            })
        );
    }

    #[test]
    fn test_parse_send_passive() {
        assert_eq!(
            parse_dcc("DCC SEND \"a\" 2130706433 0 3 7"),
            Some(DccMsg::Send {
                name: "a".into(),
                ip: 2130706433,
                port: 0,
                size: 3,
                token: Some(7)
            })
        );
    }

    #[test]
    fn test_parse_unquoted_name_with_spaces_takes_first_word() {
        assert_eq!(
            parse_dcc("SEND my.file 16909060 1234 999"),
            Some(DccMsg::Send {
                name: "my.file".into(),
                ip: 16909060,
                port: 1234,
                size: 999,
                token: None
            })
        );
    }

    #[test]
    fn test_parse_resume_accept_roundtrip() {
        assert_eq!(
            parse_dcc("DCC RESUME file.ext 1234 100"),
            Some(DccMsg::Resume { name: "file.ext".into(), port: 1234, offset: 100, token: None })
        );
        assert_eq!(
            parse_dcc(&format_accept("file.ext", 1234, 100, None)),
            Some(DccMsg::Accept { name: "file.ext".into(), port: 1234, offset: 100, token: None })
        );
        assert_eq!(
            parse_dcc(&format_resume(0, 100, Some(7))),
            Some(DccMsg::Resume { name: "file.ext".into(), port: 0, offset: 100, token: Some(7) })
        );
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert_eq!(parse_dcc("DCC SEND"), None);
        assert_eq!(parse_dcc("DCC FROB x 1 2"), None);
        assert_eq!(parse_dcc("DCC SEND \"a\" notanip 1 2"), None);
    }

    #[test]
    fn test_ip_conversions() {
        assert_eq!(ip_to_string(2130706433), "127.0.0.1");
        assert_eq!(string_to_ip("127.0.0.1"), Some(2130706433));
    }
}
