//! Replication wire protocol.
//!
//! One request shape carries both sync kinds; the master dispatches on a
//! non-empty dump session UUID. All objects go through the shared codec.

use serde::{Deserialize, Serialize};

use fq_core::codec;
use fq_core::error::Result;
use fq_core::types::DumpElem;

/// Upper bound on one replication message.
pub const MAX_REPLICATION_MESSAGE_SIZE: usize = 16 << 20;

/// Concurrent replica connections a master accepts.
pub const MAX_REPLICAS: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub dump: DumpRequest,
    pub wal: WalRequest,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DumpRequest {
    pub session_uuid: String,
    pub last_segment_number: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DumpResponse {
    pub succeed: bool,
    pub end_of_dump: bool,
    pub segment_data: Vec<DumpElem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalRequest {
    pub last_segment_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalResponse {
    pub succeed: bool,
    pub segment_name: String,
    pub segment_data: Vec<u8>,
}

impl Request {
    pub fn dump_request(session_uuid: &str, last_segment_number: u64) -> Self {
        Self {
            dump: DumpRequest {
                session_uuid: session_uuid.to_string(),
                last_segment_number,
            },
            wal: WalRequest::default(),
        }
    }

    pub fn wal_request(last_segment_name: &str) -> Self {
        Self {
            dump: DumpRequest::default(),
            wal: WalRequest {
                last_segment_name: last_segment_name.to_string(),
            },
        }
    }

    pub fn is_dump(&self) -> bool {
        !self.dump.session_uuid.is_empty()
    }
}

pub fn encode<T: Serialize>(object: &T) -> Result<Vec<u8>> {
    codec::encode(object)
}

pub fn decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
    codec::decode(data)
}
