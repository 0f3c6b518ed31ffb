//! Binary MMP frame layout.
//!
//! ```text
//! dst(6) src(6) [8100 vid(2)] [88 cc c0 ff] ethertype(2) ver(1) cmd(2) seq(2) oui(3) payload...
//! ```
//! Frames shorter than 64 bytes are zero padded. Replies are read untagged, so the
//! command echo sits at 15..17, the sequence at 17..19 and the payload starts at 22.

use thiserror::Error;

use crate::transport::MacAddr;

pub const ETHERTYPE: u16 = 0x8007;
pub const VERSION: u8 = 0x20;
pub const OUI: [u8; 3] = [0x11, 0x22, 0x33];
pub const VLAN_TPID: u16 = 0x8100;
pub const REFLECTOR: [u8; 4] = [0x88, 0xcc, 0xc0, 0xff];
pub const MIN_FRAME_LEN: usize = 64;
pub const HEADER_LEN: usize = 22;
/// Receive buffer size for one reply frame.
pub const MAX_FRAME_LEN: usize = 1000;

const CMD_OFFSET: usize = 15;
const SEQ_OFFSET: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    GetOam,
    SetOam,
    GetAna,
    SetAna,
    GetDebugCore,
    SetDebugCore,
}

impl Command {
    pub const ALL: [Command; 6] = [
        Command::GetOam,
        Command::SetOam,
        Command::GetAna,
        Command::SetAna,
        Command::GetDebugCore,
        Command::SetDebugCore,
    ];

    pub fn code(self) -> u16 {
        match self {
            Command::GetOam => 0x00a0,
            Command::SetOam => 0x00a2,
            Command::GetAna => 0x00a4,
            Command::SetAna => 0x00a6,
            Command::GetDebugCore => 0x00b8,
            Command::SetDebugCore => 0x00ba,
        }
    }

    /// The device acknowledges with the request code plus one.
    pub fn response_code(self) -> u16 {
        self.code() + 1
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }
}

/// Optional header extensions, both off unless the link needs them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameOptions {
    /// 802.1Q tag with this 12-bit VLAN id.
    pub vlan: Option<u16>,
    /// Insert the reflector preamble before the ethertype.
    pub reflector: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    Short(usize),
    #[error("unexpected ethertype 0x{0:04x}")]
    Ethertype(u16),
    #[error("unknown command code 0x{0:04x}")]
    UnknownCommand(u16),
}

/// Reply as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub command: u16,
    pub seq: u16,
    pub payload: Vec<u8>,
}

/// Request as seen by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub src: MacAddr,
    pub command: Command,
    pub seq: u16,
    pub payload: Vec<u8>,
}

pub fn build_request(
    dst: MacAddr,
    src: MacAddr,
    opts: FrameOptions,
    command: Command,
    seq: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(MIN_FRAME_LEN.max(HEADER_LEN + 8 + payload.len()));
    out.extend_from_slice(&dst.octets());
    out.extend_from_slice(&src.octets());
    if let Some(vid) = opts.vlan {
        out.extend_from_slice(&VLAN_TPID.to_be_bytes());
        out.extend_from_slice(&(vid & 0x0fff).to_be_bytes());
    }
    if opts.reflector {
        out.extend_from_slice(&REFLECTOR);
    }
    push_body(&mut out, command.code(), seq, payload);
    out
}

/// Device-side reply frame.
pub fn build_response(dst: MacAddr, src: MacAddr, code: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MIN_FRAME_LEN.max(HEADER_LEN + payload.len()));
    out.extend_from_slice(&dst.octets());
    out.extend_from_slice(&src.octets());
    push_body(&mut out, code, seq, payload);
    out
}

fn push_body(out: &mut Vec<u8>, code: u16, seq: u16, payload: &[u8]) {
    out.extend_from_slice(&ETHERTYPE.to_be_bytes());
    out.push(VERSION);
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&OUI);
    out.extend_from_slice(payload);
    if out.len() < MIN_FRAME_LEN {
        out.resize(MIN_FRAME_LEN, 0);
    }
}

pub fn parse_response(buf: &[u8]) -> Result<Response, FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(FrameError::Short(buf.len()));
    }
    let ethertype = u16::from_be_bytes([buf[12], buf[13]]);
    if ethertype != ETHERTYPE {
        return Err(FrameError::Ethertype(ethertype));
    }
    Ok(Response {
        command: u16::from_be_bytes([buf[CMD_OFFSET], buf[CMD_OFFSET + 1]]),
        seq: u16::from_be_bytes([buf[SEQ_OFFSET], buf[SEQ_OFFSET + 1]]),
        payload: buf[HEADER_LEN..].to_vec(),
    })
}

/// Parse a host request, skipping an optional VLAN tag and reflector preamble.
pub fn parse_request(buf: &[u8]) -> Result<Request, FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(FrameError::Short(buf.len()));
    }
    let mut src = [0u8; 6];
    src.copy_from_slice(&buf[6..12]);

    let mut at = 12;
    if u16::from_be_bytes([buf[at], buf[at + 1]]) == VLAN_TPID {
        at += 4;
    }
    if buf.len() >= at + 4 && buf[at..at + 4] == REFLECTOR {
        at += 4;
    }
    if buf.len() < at + 10 {
        return Err(FrameError::Short(buf.len()));
    }
    let ethertype = u16::from_be_bytes([buf[at], buf[at + 1]]);
    if ethertype != ETHERTYPE {
        return Err(FrameError::Ethertype(ethertype));
    }
    let code = u16::from_be_bytes([buf[at + 3], buf[at + 4]]);
    let command = Command::from_code(code).ok_or(FrameError::UnknownCommand(code))?;
    Ok(Request {
        src: MacAddr(src),
        command,
        seq: u16::from_be_bytes([buf[at + 5], buf[at + 6]]),
        payload: buf[at + 10..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DST: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    const SRC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);

    #[test]
    fn request_layout_is_padded() {
        let f = build_request(
            DST,
            SRC,
            FrameOptions::default(),
            Command::SetOam,
            0xbeef,
            &[0x7e, 0xce, 0x00, 0x01],
        );
        assert_eq!(f.len(), MIN_FRAME_LEN);
        assert_eq!(&f[0..6], &DST.octets());
        assert_eq!(&f[6..12], &SRC.octets());
        assert_eq!(&f[12..14], &[0x80, 0x07]);
        assert_eq!(f[14], VERSION);
        assert_eq!(&f[15..17], &[0x00, 0xa2]);
        assert_eq!(&f[17..19], &[0xbe, 0xef]);
        assert_eq!(&f[19..22], &OUI);
        assert_eq!(&f[22..26], &[0x7e, 0xce, 0x00, 0x01]);
        assert!(f[26..].iter().all(|&b| b == 0));
    }

    #[test]
    fn tagged_request_is_readable_by_device() {
        let opts = FrameOptions {
            vlan: Some(0x123),
            reflector: true,
        };
        let f = build_request(DST, SRC, opts, Command::GetAna, 7, &[0x08]);
        assert_eq!(&f[12..16], &[0x81, 0x00, 0x01, 0x23]);
        assert_eq!(&f[16..20], &REFLECTOR);
        let req = parse_request(&f).unwrap();
        assert_eq!(req.command, Command::GetAna);
        assert_eq!(req.seq, 7);
        assert_eq!(req.src, SRC);
        assert_eq!(req.payload[0], 0x08);
    }

    #[test]
    fn large_page_reply_is_not_truncated() {
        let payload = vec![0x5a; 513];
        let f = build_response(SRC, DST, Command::GetDebugCore.response_code(), 1, &payload);
        assert_eq!(f.len(), HEADER_LEN + 513);
        let r = parse_response(&f).unwrap();
        assert_eq!(r.command, 0x00b9);
        assert_eq!(r.payload.len(), 513);
    }

    #[test]
    fn rejects_foreign_frames() {
        assert_eq!(parse_response(&[0u8; 10]), Err(FrameError::Short(10)));
        let mut f = build_response(SRC, DST, 0x00a1, 1, &[0]);
        f[12] = 0x08;
        f[13] = 0x00;
        assert_eq!(parse_response(&f), Err(FrameError::Ethertype(0x0800)));
        assert_eq!(Command::from_code(0x00a1), None);
    }
}
