//! Stable binary codec.
//!
//! One MessagePack encoder serves every persistent and wire object kind:
//! WAL record batches, dump element batches and replication protocol
//! messages. Round-trips are byte-exact, which the WAL format depends on.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|e| Error::Codec {
        message: format!("encode: {e}"),
    })
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    rmp_serde::from_slice(data).map_err(|e| Error::Codec {
        message: format!("decode: {e}"),
    })
}

/// Decode a single object from a reader, leaving the reader positioned at
/// the next one. Dump read sessions consume their buffer batch by batch
/// this way.
pub fn decode_from<R: std::io::Read, T: DeserializeOwned>(reader: R) -> Result<T> {
    rmp_serde::from_read(reader).map_err(|e| Error::Codec {
        message: format!("decode: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DumpElem;

    #[test]
    fn round_trip_is_byte_exact() {
        let elem = DumpElem {
            key: "api_calls".to_string(),
            batch_size: 60,
            value: 17,
            tx_at: 1_700_000_000,
            tx: 42,
        };

        let first = encode(&elem).unwrap();
        let second = encode(&decode::<DumpElem>(&first).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn decode_from_consumes_sequential_objects() {
        let a = DumpElem {
            key: "a".to_string(),
            batch_size: 1,
            value: 1,
            tx_at: 10,
            tx: 1,
        };
        let b = DumpElem {
            key: "b".to_string(),
            batch_size: 2,
            value: 2,
            tx_at: 20,
            tx: 2,
        };

        let mut buf = encode(&a).unwrap();
        buf.extend(encode(&b).unwrap());

        let mut cursor = std::io::Cursor::new(buf);
        let first: DumpElem = decode_from(&mut cursor).unwrap();
        let second: DumpElem = decode_from(&mut cursor).unwrap();
        assert_eq!(first, a);
        assert_eq!(second, b);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode::<DumpElem>(&[0xff, 0x00, 0x13]).is_err());
    }
}
