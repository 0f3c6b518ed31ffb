/// One request of the ASCII control protocol. Each is sent as a single datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsciiCommand {
    // ---- Registers ----
    OamRead { llid: u8, reg: u8 },
    OamWrite { llid: u8, reg: u8, value: u16 },
    AnaRead { reg: u16 },
    AnaWrite { reg: u16, value: u16 },
    TunerRead { reg: u8 },
    TunerWrite { reg: u8, value: u8 },

    // ---- Debug core ----
    DbgcSet {
        clock: u32,
        event: u32,
        point: u32,
        mode: u32,
    },
    DbgcStatus,
    DbgcDump { offset: u32 },
}

impl AsciiCommand {
    pub fn tag(&self) -> &'static str {
        match self {
            AsciiCommand::OamRead { .. } => "OAMR",
            AsciiCommand::OamWrite { .. } => "OAMW",
            AsciiCommand::AnaRead { .. } => "ANAR",
            AsciiCommand::AnaWrite { .. } => "ANAW",
            AsciiCommand::TunerRead { .. } => "TUNR",
            AsciiCommand::TunerWrite { .. } => "TUNW",
            AsciiCommand::DbgcSet { .. } => "DBGC:SET",
            AsciiCommand::DbgcStatus => "DBGC:STAT?",
            AsciiCommand::DbgcDump { .. } => "DBGC:DUMP",
        }
    }
}

/// Status word the responder sends for `:DBGC:STAT?` once a capture is ready.
pub const STATUS_READY: &str = "READY";
