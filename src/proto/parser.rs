use std::fmt::Write;

use thiserror::Error;

use super::command::AsciiCommand;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("missing ':' prefix")]
    MissingPrefix,
    #[error("missing argument: {0}")]
    MissingArg(&'static str),
    #[error("invalid hex for {0}: {1}")]
    BadHex(&'static str, String),
    #[error("value out of range for {0}: {1}")]
    Range(&'static str, String),
    #[error("unexpected trailing argument: {0}")]
    Trailing(String),
    #[error("unknown tag: {0}")]
    UnknownTag(String),
    #[error("dump page: {0}")]
    Page(&'static str),
}

/// Public API: serialize a command to its request line (no terminator).
pub fn format_command(cmd: &AsciiCommand) -> String {
    use AsciiCommand::*;
    let mut out = String::from(":");
    out.push_str(cmd.tag());

    match *cmd {
        OamRead { llid, reg } => {
            let _ = write!(out, " 0x{:02x}{:02x}", llid, reg);
        }
        OamWrite { llid, reg, value } => {
            let _ = write!(out, " 0x{:02x}{:02x} 0x{:04x}", llid, reg, value);
        }
        AnaRead { reg } => {
            let _ = write!(out, " 0x{:04x}", reg);
        }
        AnaWrite { reg, value } => {
            let _ = write!(out, " 0x{:04x} 0x{:04x}", reg, value);
        }
        TunerRead { reg } => {
            let _ = write!(out, " 0x{:02x}", reg);
        }
        TunerWrite { reg, value } => {
            let _ = write!(out, " 0x{:02x} 0x{:02x}", reg, value);
        }
        DbgcSet {
            clock,
            event,
            point,
            mode,
        } => {
            let _ = write!(
                out,
                " 0x{:08x} 0x{:08x} 0x{:08x} 0x{:08x}",
                clock, event, point, mode
            );
        }
        DbgcStatus => {}
        DbgcDump { offset } => {
            let _ = write!(out, " 0x{:x}", offset);
        }
    }
    out
}

/// Public API: parse a request line (device side of the protocol).
pub fn parse_command(line: &str) -> Result<AsciiCommand, ParseError> {
    let s = line.trim_matches(|c| c == '\r' || c == '\n' || c == ' ' || c == '\0');
    if s.is_empty() {
        return Err(ParseError::Empty);
    }
    let s = s.strip_prefix(':').ok_or(ParseError::MissingPrefix)?;

    let mut tokens = s.split_whitespace();
    let tag = tokens.next().ok_or(ParseError::Empty)?.to_ascii_uppercase();
    let mut args = Args { it: tokens };

    use AsciiCommand::*;
    let cmd = match tag.as_str() {
        "OAMR" => {
            let (llid, reg) = split_oam(args.req("addr", 0xffff)?);
            OamRead { llid, reg }
        }
        "OAMW" => {
            let (llid, reg) = split_oam(args.req("addr", 0xffff)?);
            OamWrite {
                llid,
                reg,
                value: args.req("value", 0xffff)? as u16,
            }
        }
        "ANAR" => AnaRead {
            reg: args.req("reg", 0xffff)? as u16,
        },
        "ANAW" => AnaWrite {
            reg: args.req("reg", 0xffff)? as u16,
            value: args.req("value", 0xffff)? as u16,
        },
        "TUNR" => TunerRead {
            reg: args.req("reg", 0xff)? as u8,
        },
        "TUNW" => TunerWrite {
            reg: args.req("reg", 0xff)? as u8,
            value: args.req("value", 0xff)? as u8,
        },
        "DBGC:SET" => DbgcSet {
            clock: args.req("clock", u32::MAX)?,
            event: args.req("event", u32::MAX)?,
            point: args.req("point", u32::MAX)?,
            mode: args.req("mode", u32::MAX)?,
        },
        "DBGC:STAT?" => DbgcStatus,
        "DBGC:DUMP" => DbgcDump {
            offset: args.req("offset", u32::MAX)?,
        },
        _ => return Err(ParseError::UnknownTag(tag)),
    };
    args.finish()?;
    Ok(cmd)
}

/// First whitespace-separated token of a reply datagram.
pub fn reply_token(buf: &[u8]) -> Option<String> {
    String::from_utf8_lossy(buf)
        .split(|c: char| c.is_whitespace() || c == '\0')
        .find(|t| !t.is_empty())
        .map(str::to_string)
}

/// Hex with or without a `0x` prefix.
pub fn parse_hex(field: &'static str, tok: &str) -> Result<u32, ParseError> {
    let digits = tok
        .strip_prefix("0x")
        .or_else(|| tok.strip_prefix("0X"))
        .unwrap_or(tok);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ParseError::BadHex(field, tok.to_string()));
    }
    u32::from_str_radix(digits, 16).map_err(|_| ParseError::BadHex(field, tok.to_string()))
}

/// Dump page as text: 8 hex digits of word count, then 8 hex digits per word.
pub fn format_dump_page(words: &[u32]) -> String {
    let mut out = String::with_capacity(8 + words.len() * 8);
    let _ = write!(out, "{:08x}", words.len());
    for w in words {
        let _ = write!(out, "{:08x}", w);
    }
    out
}

pub fn parse_dump_page(tok: &str) -> Result<Vec<u32>, ParseError> {
    if tok.len() < 8 || !tok.is_ascii() {
        return Err(ParseError::Page("header shorter than 8 hex digits"));
    }
    let len = parse_hex("page length", &tok[..8])? as usize;
    let body = &tok[8..];
    if body.len() < len * 8 {
        return Err(ParseError::Page("fewer words than announced"));
    }
    (0..len)
        .map(|i| parse_hex("page word", &body[i * 8..i * 8 + 8]))
        .collect()
}

/* ---------- helpers ---------- */

struct Args<'a, I: Iterator<Item = &'a str>> {
    it: I,
}

impl<'a, I: Iterator<Item = &'a str>> Args<'a, I> {
    fn req(&mut self, k: &'static str, max: u32) -> Result<u32, ParseError> {
        let tok = self.it.next().ok_or(ParseError::MissingArg(k))?;
        let v = parse_hex(k, tok)?;
        if v > max {
            return Err(ParseError::Range(k, tok.to_string()));
        }
        Ok(v)
    }

    fn finish(mut self) -> Result<(), ParseError> {
        match self.it.next() {
            Some(extra) => Err(ParseError::Trailing(extra.to_string())),
            None => Ok(()),
        }
    }
}

fn split_oam(addr: u32) -> (u8, u8) {
    ((addr >> 8) as u8, addr as u8)
}

/* ---------- tests ---------- */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_forms() {
        assert_eq!(
            format_command(&AsciiCommand::OamRead { llid: 0x7e, reg: 0x74 }),
            ":OAMR 0x7e74"
        );
        assert_eq!(
            format_command(&AsciiCommand::OamWrite {
                llid: 0x7e,
                reg: 0x74,
                value: 0x55aa
            }),
            ":OAMW 0x7e74 0x55aa"
        );
        assert_eq!(
            format_command(&AsciiCommand::AnaWrite { reg: 0x0008, value: 0x1234 }),
            ":ANAW 0x0008 0x1234"
        );
        assert_eq!(
            format_command(&AsciiCommand::TunerWrite { reg: 0x03, value: 0x5a }),
            ":TUNW 0x03 0x5a"
        );
        assert_eq!(
            format_command(&AsciiCommand::DbgcSet {
                clock: 0x10,
                event: 0x1000_0001,
                point: 0x1000_1fff,
                mode: 0x4000_0000
            }),
            ":DBGC:SET 0x00000010 0x10000001 0x10001fff 0x40000000"
        );
        assert_eq!(format_command(&AsciiCommand::DbgcStatus), ":DBGC:STAT?");
        assert_eq!(
            format_command(&AsciiCommand::DbgcDump { offset: 0x180 }),
            ":DBGC:DUMP 0x180"
        );
    }

    #[test]
    fn parse_oam_write() {
        let cmd = parse_command(":OAMW 0x7ece 0x0001\r\n").unwrap();
        assert_eq!(
            cmd,
            AsciiCommand::OamWrite {
                llid: 0x7e,
                reg: 0xce,
                value: 1
            }
        );
    }

    #[test]
    fn parse_is_case_insensitive_on_tag() {
        assert_eq!(parse_command(":dbgc:stat?").unwrap(), AsciiCommand::DbgcStatus);
        assert_eq!(
            parse_command(":tunr 3").unwrap(),
            AsciiCommand::TunerRead { reg: 3 }
        );
    }

    #[test]
    fn error_cases() {
        assert_eq!(parse_command(""), Err(ParseError::Empty));
        assert_eq!(parse_command("OAMR 0x7e00"), Err(ParseError::MissingPrefix));
        assert!(matches!(parse_command(":FOO 1"), Err(ParseError::UnknownTag(_))));
        assert_eq!(parse_command(":ANAW 0x08"), Err(ParseError::MissingArg("value")));
        assert!(matches!(parse_command(":ANAR 0xzz"), Err(ParseError::BadHex("reg", _))));
        assert!(matches!(parse_command(":TUNW 0x03 0x100"), Err(ParseError::Range("value", _))));
        assert!(matches!(parse_command(":DBGC:STAT? 1"), Err(ParseError::Trailing(_))));
    }

    #[test]
    fn hex_needs_digits_only() {
        assert_eq!(parse_hex("v", "0x1f"), Ok(0x1f));
        assert_eq!(parse_hex("v", "1F"), Ok(0x1f));
        assert!(parse_hex("v", "+1f").is_err());
        assert!(parse_hex("v", "0x+1f").is_err());
        assert!(parse_hex("v", "0x").is_err());
        assert!(matches!(parse_command(":ANAR +8"), Err(ParseError::BadHex("reg", _))));
        assert!(parse_dump_page("+0000001deadbeef").is_err());
    }

    #[test]
    fn reply_token_takes_first_word() {
        assert_eq!(reply_token(b"0x00ff\r\n").as_deref(), Some("0x00ff"));
        assert_eq!(reply_token(b"  READY extra").as_deref(), Some("READY"));
        assert_eq!(reply_token(b"\0\0"), None);
    }

    #[test]
    fn dump_page_text() {
        let page = format_dump_page(&[1, 0xdead_beef]);
        assert_eq!(page, "0000000200000001deadbeef");
        assert_eq!(parse_dump_page(&page).unwrap(), vec![1, 0xdead_beef]);
        assert_eq!(parse_dump_page("00000000").unwrap(), Vec::<u32>::new());
        assert!(parse_dump_page("0000000300000001").is_err());
        assert!(parse_dump_page("0003").is_err());
    }
}
