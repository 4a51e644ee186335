//! Wire format for one WAL record (C8).
//!
//! A record is self-delimiting: `u32 total_len | u64 tx_id | u8 kind |
//! body`, all multi-byte fields little-endian so a log written on one
//! machine replays correctly on another. `total_len` counts everything
//! after itself (the `tx_id`, `kind` and `body` fields). A reader that hits
//! a short read while filling
//! either the length prefix or the body treats the remainder of the file as
//! a torn trailing record and stops, rather than erroring — the same
//! tolerance a crash mid-`write_all` demands of any append-only log.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use vtm_core::address::FarAddress;
use vtm_core::region::Rwr;

const KIND_WRITE: u8 = 0;
const KIND_COMMIT: u8 = 1;
const KIND_ROLLBACK: u8 = 2;

/// The body of a single WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    /// An intention to overwrite `region` with `bytes` once committed.
    Write {
        /// The byte range this write targets.
        region: Rwr,
        /// The bytes to materialize into `region` on commit.
        bytes: Vec<u8>,
    },
    /// Terminates a transaction successfully.
    Commit,
    /// Terminates a transaction without applying its writes.
    Rollback,
}

/// One fully-decoded WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The transaction this record belongs to.
    pub tx_id: u64,
    /// The record's payload.
    pub body: RecordBody,
}

impl Record {
    /// Whether this record terminates a transaction (commit or rollback),
    /// the unit file rotation counts by.
    pub fn is_terminator(&self) -> bool {
        matches!(self.body, RecordBody::Commit | RecordBody::Rollback)
    }

    /// Serialize this record to its on-disk byte representation.
    pub fn encode(&self) -> Vec<u8> {
        let (kind, region_bytes, payload): (u8, usize, &[u8]) = match &self.body {
            RecordBody::Write { bytes, .. } => (KIND_WRITE, 12, bytes.as_slice()),
            RecordBody::Commit => (KIND_COMMIT, 0, &[]),
            RecordBody::Rollback => (KIND_ROLLBACK, 0, &[]),
        };
        let total_len = 8 + 1 + region_bytes + payload.len();
        let mut out = Vec::with_capacity(4 + total_len);
        out.write_u32::<LittleEndian>(total_len as u32).unwrap();
        out.write_u64::<LittleEndian>(self.tx_id).unwrap();
        out.push(kind);
        if let RecordBody::Write { region, .. } = &self.body {
            out.write_u32::<LittleEndian>(region.address().segment())
                .unwrap();
            out.write_u32::<LittleEndian>(region.address().offset())
                .unwrap();
            out.write_u32::<LittleEndian>(region.byte_count()).unwrap();
        }
        out.extend_from_slice(payload);
        out
    }

    /// Write this record to `writer`.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.encode())
    }
}

/// Outcome of attempting to decode one record from a byte stream.
pub enum DecodeOutcome {
    /// A full record was decoded.
    Record(Record),
    /// The stream ended cleanly on a record boundary.
    Eof,
    /// A short read interrupted the record; the caller should treat
    /// everything from here to the end of the file as discarded.
    Torn,
}

/// Read one record from `reader`, distinguishing a clean end-of-file from a
/// torn trailing record.
pub fn decode_one<R: Read>(reader: &mut R) -> io::Result<DecodeOutcome> {
    let mut len_bytes = [0u8; 4];
    match read_fully(reader, &mut len_bytes)? {
        0 => return Ok(DecodeOutcome::Eof),
        n if n < len_bytes.len() => return Ok(DecodeOutcome::Torn),
        _ => {}
    }
    let mut len_cursor = io::Cursor::new(len_bytes);
    let total_len = len_cursor.read_u32::<LittleEndian>()? as usize;
    if total_len < 9 {
        return Ok(DecodeOutcome::Torn);
    }
    let mut body = vec![0u8; total_len];
    if read_fully(reader, &mut body)? < total_len {
        return Ok(DecodeOutcome::Torn);
    }
    let mut cursor = io::Cursor::new(&body[0..8]);
    let tx_id = cursor.read_u64::<LittleEndian>()?;
    let kind = body[8];
    let rest = &body[9..];
    let record = match kind {
        KIND_WRITE => {
            if rest.len() < 12 {
                return Ok(DecodeOutcome::Torn);
            }
            let mut fields = io::Cursor::new(&rest[0..12]);
            let segment = fields.read_u32::<LittleEndian>()?;
            let offset = fields.read_u32::<LittleEndian>()?;
            let byte_count = fields.read_u32::<LittleEndian>()?;
            let bytes = &rest[12..];
            if bytes.len() != byte_count as usize {
                return Ok(DecodeOutcome::Torn);
            }
            Record {
                tx_id,
                body: RecordBody::Write {
                    region: Rwr::new(FarAddress::new(segment, offset), byte_count),
                    bytes: bytes.to_vec(),
                },
            }
        }
        KIND_COMMIT => Record {
            tx_id,
            body: RecordBody::Commit,
        },
        KIND_ROLLBACK => Record {
            tx_id,
            body: RecordBody::Rollback,
        },
        _ => return Ok(DecodeOutcome::Torn),
    };
    Ok(DecodeOutcome::Record(record))
}

/// Like `Read::read_exact` but returns the number of bytes actually read
/// instead of erroring on a short read, so the caller can tell a torn
/// record from a clean EOF.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_record_round_trips() {
        let record = Record {
            tx_id: 42,
            body: RecordBody::Write {
                region: Rwr::new(FarAddress::new(3, 128), 4),
                bytes: vec![1, 2, 3, 4],
            },
        };
        let bytes = record.encode();
        let mut cursor = io::Cursor::new(bytes);
        match decode_one(&mut cursor).unwrap() {
            DecodeOutcome::Record(decoded) => assert_eq!(decoded, record),
            _ => panic!("expected a decoded record"),
        }
    }

    #[test]
    fn commit_record_has_empty_payload() {
        let record = Record {
            tx_id: 7,
            body: RecordBody::Commit,
        };
        assert!(record.is_terminator());
        let bytes = record.encode();
        assert_eq!(bytes.len(), 4 + 8 + 1);
    }

    #[test]
    fn clean_eof_is_distinguished_from_torn_record() {
        let mut empty = io::Cursor::new(Vec::<u8>::new());
        assert!(matches!(decode_one(&mut empty).unwrap(), DecodeOutcome::Eof));

        let record = Record {
            tx_id: 1,
            body: RecordBody::Commit,
        };
        let mut bytes = record.encode();
        bytes.truncate(bytes.len() - 2);
        let mut cursor = io::Cursor::new(bytes);
        assert!(matches!(decode_one(&mut cursor).unwrap(), DecodeOutcome::Torn));
    }

    #[test]
    fn sequential_records_decode_in_order() {
        let a = Record {
            tx_id: 1,
            body: RecordBody::Write {
                region: Rwr::new(FarAddress::new(0, 0), 2),
                bytes: vec![9, 9],
            },
        };
        let b = Record {
            tx_id: 1,
            body: RecordBody::Commit,
        };
        let mut buf = Vec::new();
        a.write_to(&mut buf).unwrap();
        b.write_to(&mut buf).unwrap();

        let mut cursor = io::Cursor::new(buf);
        let first = match decode_one(&mut cursor).unwrap() {
            DecodeOutcome::Record(r) => r,
            _ => panic!("expected a"),
        };
        let second = match decode_one(&mut cursor).unwrap() {
            DecodeOutcome::Record(r) => r,
            _ => panic!("expected b"),
        };
        assert_eq!(first, a);
        assert_eq!(second, b);
        assert!(matches!(decode_one(&mut cursor).unwrap(), DecodeOutcome::Eof));
    }
}
