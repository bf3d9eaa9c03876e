//! The framed record protocol shared with the collector daemon.
//!
//! Every record travels as a little-endian `u32` frame length followed by a
//! one-byte record tag and the payload. The client encodes `Handshake`,
//! `Malloc`, and `Free`, and decodes `ClientConfig`; the full codec lives
//! here anyway because the daemon-side tests drive both directions.
//!
//! The hot path never allocates: malloc/free records are fixed-size and are
//! encoded into caller-provided stack buffers.

use std::io::{Cursor, Read};

use bytes::{Buf, BufMut, BytesMut, LittleEndian};
use enum_primitive::FromPrimitive;

use error::{Error, Result};

/// Upper bound on a sane frame; anything bigger is a corrupt stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Frame bytes of an encoded malloc record: length + tag + heap + id +
/// sampled + raw.
pub const MALLOC_FRAME_LEN: usize = 4 + 1 + 4 + 8 + 8 + 8;
/// Frame bytes of an encoded free record: length + tag + heap + id.
pub const FREE_FRAME_LEN: usize = 4 + 1 + 4 + 8;

enum_from_primitive! {
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordType {
    Handshake = 1,
    ClientConfig = 2,
    Malloc = 3,
    Free = 4,
}
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Handshake {
    pub pid: u64,
    pub cmdline: String,
    pub heap_names: Vec<String>,
}

/// One heap's share of the negotiated configuration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct HeapConfig {
    pub name: String,
    pub service_heap_id: u32,
    /// Mean bytes between sampling points for this heap.
    pub sampling_interval: u64,
}

/// The daemon's authoritative answer to a handshake.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ClientConfig {
    pub heaps: Vec<HeapConfig>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MallocRecord {
    pub service_heap_id: u32,
    pub alloc_id: u64,
    pub sampled_size: u64,
    pub raw_size: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FreeRecord {
    pub service_heap_id: u32,
    pub alloc_id: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Record {
    Handshake(Handshake),
    ClientConfig(ClientConfig),
    Malloc(MallocRecord),
    Free(FreeRecord),
}

#[derive(Clone, Debug, Eq, Fail, PartialEq)]
pub enum DecodeError {
    #[fail(display = "frame of {} bytes exceeds the {} byte cap", len, cap)]
    Oversize { len: usize, cap: usize },
    #[fail(display = "record ended short of its declared length")]
    Truncated,
    #[fail(display = "unknown record tag {}", tag)]
    UnknownTag { tag: u8 },
    #[fail(display = "string field is not valid utf-8")]
    BadString,
}

fn put_str(buf: &mut BytesMut, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::max_value() as usize);
    buf.reserve(2 + len);
    buf.put_u16::<LittleEndian>(len as u16);
    buf.put_slice(&bytes[..len]);
}

fn get_str(cur: &mut Cursor<&[u8]>) -> ::std::result::Result<String, DecodeError> {
    if cur.remaining() < 2 {
        return Err(DecodeError::Truncated);
    }
    let len = cur.get_u16::<LittleEndian>() as usize;
    if cur.remaining() < len {
        return Err(DecodeError::Truncated);
    }
    let mut bytes = vec![0u8; len];
    cur.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| DecodeError::BadString)
}

/// Encodes any record into a fresh length-prefixed frame.
pub fn encode_record(record: &Record) -> BytesMut {
    let mut payload = BytesMut::with_capacity(64);
    let tag = match *record {
        Record::Handshake(ref hs) => {
            payload.reserve(8);
            payload.put_u64::<LittleEndian>(hs.pid);
            put_str(&mut payload, &hs.cmdline);
            payload.reserve(2);
            payload.put_u16::<LittleEndian>(hs.heap_names.len() as u16);
            for name in &hs.heap_names {
                put_str(&mut payload, name);
            }
            RecordType::Handshake
        }
        Record::ClientConfig(ref config) => {
            payload.reserve(2);
            payload.put_u16::<LittleEndian>(config.heaps.len() as u16);
            for heap in &config.heaps {
                put_str(&mut payload, &heap.name);
                payload.reserve(12);
                payload.put_u32::<LittleEndian>(heap.service_heap_id);
                payload.put_u64::<LittleEndian>(heap.sampling_interval);
            }
            RecordType::ClientConfig
        }
        Record::Malloc(ref rec) => {
            payload.reserve(28);
            payload.put_u32::<LittleEndian>(rec.service_heap_id);
            payload.put_u64::<LittleEndian>(rec.alloc_id);
            payload.put_u64::<LittleEndian>(rec.sampled_size);
            payload.put_u64::<LittleEndian>(rec.raw_size);
            RecordType::Malloc
        }
        Record::Free(ref rec) => {
            payload.reserve(12);
            payload.put_u32::<LittleEndian>(rec.service_heap_id);
            payload.put_u64::<LittleEndian>(rec.alloc_id);
            RecordType::Free
        }
    };

    let mut frame = BytesMut::with_capacity(5 + payload.len());
    frame.put_u32::<LittleEndian>(1 + payload.len() as u32);
    frame.put_u8(tag as u8);
    frame.put_slice(&payload);
    frame
}

/// Encodes a malloc record into a stack buffer. Allocation-free.
pub fn encode_malloc_into(rec: &MallocRecord, buf: &mut [u8; MALLOC_FRAME_LEN]) {
    let mut w = Cursor::new(&mut buf[..]);
    w.put_u32::<LittleEndian>((MALLOC_FRAME_LEN - 4) as u32);
    w.put_u8(RecordType::Malloc as u8);
    w.put_u32::<LittleEndian>(rec.service_heap_id);
    w.put_u64::<LittleEndian>(rec.alloc_id);
    w.put_u64::<LittleEndian>(rec.sampled_size);
    w.put_u64::<LittleEndian>(rec.raw_size);
}

/// Encodes a free record into a stack buffer. Allocation-free.
pub fn encode_free_into(rec: &FreeRecord, buf: &mut [u8; FREE_FRAME_LEN]) {
    let mut w = Cursor::new(&mut buf[..]);
    w.put_u32::<LittleEndian>((FREE_FRAME_LEN - 4) as u32);
    w.put_u8(RecordType::Free as u8);
    w.put_u32::<LittleEndian>(rec.service_heap_id);
    w.put_u64::<LittleEndian>(rec.alloc_id);
}

/// Decodes one frame body (tag byte + payload, the length prefix already
/// consumed).
pub fn decode_frame(frame: &[u8]) -> Result<Record> {
    let mut cur = Cursor::new(frame);
    if cur.remaining() < 1 {
        return Err(Error::from(DecodeError::Truncated));
    }
    let tag = cur.get_u8();
    let record_type = match RecordType::from_u8(tag) {
        Some(t) => t,
        None => return Err(Error::from(DecodeError::UnknownTag { tag })),
    };

    let record = match record_type {
        RecordType::Handshake => {
            if cur.remaining() < 8 {
                return Err(Error::from(DecodeError::Truncated));
            }
            let pid = cur.get_u64::<LittleEndian>();
            let cmdline = get_str(&mut cur)?;
            if cur.remaining() < 2 {
                return Err(Error::from(DecodeError::Truncated));
            }
            let count = cur.get_u16::<LittleEndian>();
            let mut heap_names = Vec::with_capacity(count as usize);
            for _ in 0..count {
                heap_names.push(get_str(&mut cur)?);
            }
            Record::Handshake(Handshake {
                pid,
                cmdline,
                heap_names,
            })
        }
        RecordType::ClientConfig => {
            if cur.remaining() < 2 {
                return Err(Error::from(DecodeError::Truncated));
            }
            let count = cur.get_u16::<LittleEndian>();
            let mut heaps = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let name = get_str(&mut cur)?;
                if cur.remaining() < 12 {
                    return Err(Error::from(DecodeError::Truncated));
                }
                let service_heap_id = cur.get_u32::<LittleEndian>();
                let sampling_interval = cur.get_u64::<LittleEndian>();
                heaps.push(HeapConfig {
                    name,
                    service_heap_id,
                    sampling_interval,
                });
            }
            Record::ClientConfig(ClientConfig { heaps })
        }
        RecordType::Malloc => {
            if cur.remaining() < 28 {
                return Err(Error::from(DecodeError::Truncated));
            }
            Record::Malloc(MallocRecord {
                service_heap_id: cur.get_u32::<LittleEndian>(),
                alloc_id: cur.get_u64::<LittleEndian>(),
                sampled_size: cur.get_u64::<LittleEndian>(),
                raw_size: cur.get_u64::<LittleEndian>(),
            })
        }
        RecordType::Free => {
            if cur.remaining() < 12 {
                return Err(Error::from(DecodeError::Truncated));
            }
            Record::Free(FreeRecord {
                service_heap_id: cur.get_u32::<LittleEndian>(),
                alloc_id: cur.get_u64::<LittleEndian>(),
            })
        }
    };

    Ok(record)
}

/// Reads one length-delimited record off a blocking reader.
pub fn read_record<R: Read>(reader: &mut R) -> Result<Record> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let len = Cursor::new(&header[..]).get_u32::<LittleEndian>() as usize;
    if len == 0 {
        return Err(Error::from(DecodeError::Truncated));
    }
    if len > MAX_FRAME_LEN {
        return Err(Error::from(DecodeError::Oversize {
            len,
            cap: MAX_FRAME_LEN,
        }));
    }

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame)?;
    decode_frame(&frame)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn roundtrip(record: Record) -> Record {
        let frame = encode_record(&record);
        read_record(&mut Cursor::new(frame.as_ref())).expect("roundtrip decode")
    }

    #[test]
    fn handshake_roundtrip() {
        let record = Record::Handshake(Handshake {
            pid: 4242,
            cmdline: "com.example.app".to_string(),
            heap_names: vec!["libc.malloc".to_string(), "art".to_string()],
        });
        assert_eq!(roundtrip(record.clone()), record);
    }

    #[test]
    fn client_config_roundtrip() {
        let record = Record::ClientConfig(ClientConfig {
            heaps: vec![HeapConfig {
                name: "libc.malloc".to_string(),
                service_heap_id: 3,
                sampling_interval: 4096,
            }],
        });
        assert_eq!(roundtrip(record.clone()), record);
    }

    #[test]
    fn malloc_fixed_buffer_matches_generic_encoder() {
        let rec = MallocRecord {
            service_heap_id: 3,
            alloc_id: 0xAA,
            sampled_size: 4096,
            raw_size: 100,
        };
        let mut fixed = [0u8; MALLOC_FRAME_LEN];
        encode_malloc_into(&rec, &mut fixed);
        assert_eq!(&fixed[..], encode_record(&Record::Malloc(rec)).as_ref());

        let decoded = read_record(&mut Cursor::new(&fixed[..])).unwrap();
        assert_eq!(decoded, Record::Malloc(rec));
    }

    #[test]
    fn free_fixed_buffer_matches_generic_encoder() {
        let rec = FreeRecord {
            service_heap_id: 3,
            alloc_id: 0xAA,
        };
        let mut fixed = [0u8; FREE_FRAME_LEN];
        encode_free_into(&rec, &mut fixed);
        assert_eq!(&fixed[..], encode_record(&Record::Free(rec)).as_ref());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = decode_frame(&[9, 0, 0]).unwrap_err();
        assert_eq!(
            format!("{}", err),
            "Malformed record from the collector: unknown record tag 9"
        );
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let rec = MallocRecord {
            service_heap_id: 1,
            alloc_id: 2,
            sampled_size: 3,
            raw_size: 4,
        };
        let frame = encode_record(&Record::Malloc(rec));
        // chop the declared frame short
        assert!(read_record(&mut Cursor::new(&frame.as_ref()[..frame.len() - 4])).is_err());
    }
}
