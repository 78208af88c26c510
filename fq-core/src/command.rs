//! Command identifiers shared by the compute layer, the WAL record format
//! and the engine's replay path. The numeric values are part of the on-disk
//! WAL format and must stay stable.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandId {
    Unknown = 0,
    Incr = 1,
    Get = 2,
    Del = 3,
    MsgSize = 4,
    MDel = 5,
    Watch = 6,
}

pub const INCR_COMMAND: &str = "INCR";
pub const GET_COMMAND: &str = "GET";
pub const DEL_COMMAND: &str = "DEL";
pub const MSG_SIZE_COMMAND: &str = "MSGSIZE";
pub const MDEL_COMMAND: &str = "MDEL";
pub const WATCH_COMMAND: &str = "WATCH";

impl CommandId {
    pub fn from_name(name: &str) -> Self {
        match name {
            INCR_COMMAND => CommandId::Incr,
            GET_COMMAND => CommandId::Get,
            DEL_COMMAND => CommandId::Del,
            MSG_SIZE_COMMAND => CommandId::MsgSize,
            MDEL_COMMAND => CommandId::MDel,
            WATCH_COMMAND => CommandId::Watch,
            _ => CommandId::Unknown,
        }
    }

    pub fn from_u32(id: u32) -> Self {
        match id {
            1 => CommandId::Incr,
            2 => CommandId::Get,
            3 => CommandId::Del,
            4 => CommandId::MsgSize,
            5 => CommandId::MDel,
            6 => CommandId::Watch,
            _ => CommandId::Unknown,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}
