//! Binary protocol between clients and the coordinator
//!
//! Wire format (all integers are big-endian):
//!
//! Request/Response frame:
//! ```text
//! +--------+--------+------------------+
//! | type   | length | payload          |
//! | 1 byte | 4 bytes| variable         |
//! +--------+--------+------------------+
//! ```
//!
//! Message types:
//! - 0x01: FileInfoReq (no payload)
//! - 0x02: FileInfoResp (count:4, records)
//! - 0x03: UpdateFile (name_len:2, name, expected_version:8, hash_list)
//! - 0x04: UpdateOk (version:8)
//! - 0x05: UpdateConflict (record)
//! - 0x06: GetBlock (hash:32)
//! - 0x07: BlockData (raw bytes)
//! - 0x08: PutBlock (raw bytes)
//! - 0x09: BlockStored (hash:32)
//! - 0x0A: HasBlocks (count:4, hashes:[32]*count)
//! - 0x0B: HaveBlocks (count:4, hashes:[32]*count)
//! - 0x0E: Error (kind:1, message)
//!
//! A record is name_len:2, name, version:8, hash_list; a hash list is a
//! tombstone flag byte followed (for the non-tombstone case) by count:4 and
//! the raw 32-byte digests.

use std::io::{Cursor, Read, Write};

use bytes::Bytes;

use crate::error::SyncError;
use crate::hash::BlockHash;
use crate::meta::{FileMeta, HashList};

/// Message type identifiers
pub mod msg {
    pub const FILE_INFO_REQ: u8 = 0x01;
    pub const FILE_INFO_RESP: u8 = 0x02;
    pub const UPDATE_FILE: u8 = 0x03;
    pub const UPDATE_OK: u8 = 0x04;
    pub const UPDATE_CONFLICT: u8 = 0x05;
    pub const GET_BLOCK: u8 = 0x06;
    pub const BLOCK_DATA: u8 = 0x07;
    pub const PUT_BLOCK: u8 = 0x08;
    pub const BLOCK_STORED: u8 = 0x09;
    pub const HAS_BLOCKS: u8 = 0x0A;
    pub const HAVE_BLOCKS: u8 = 0x0B;
    pub const ERROR: u8 = 0x0E;
}

/// Error kinds carried by an Error frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Generic,
    NotFound,
}

impl ErrorKind {
    fn to_byte(self) -> u8 {
        match self {
            Self::Generic => 0,
            Self::NotFound => 1,
        }
    }

    fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::NotFound,
            _ => Self::Generic,
        }
    }
}

/// Message received from the wire
#[derive(Debug)]
pub enum Message {
    FileInfoReq,
    FileInfoResp { records: Vec<FileMeta> },
    UpdateFile {
        file_name: String,
        expected_version: u64,
        hash_list: HashList,
    },
    UpdateOk { version: u64 },
    UpdateConflict { record: FileMeta },
    GetBlock { hash: BlockHash },
    BlockData { data: Bytes },
    PutBlock { data: Bytes },
    BlockStored { hash: BlockHash },
    HasBlocks { hashes: Vec<BlockHash> },
    HaveBlocks { hashes: Vec<BlockHash> },
    Error { kind: ErrorKind, message: String },
}

fn write_header<W: Write>(w: &mut W, msg_type: u8, len: u32) -> std::io::Result<()> {
    w.write_all(&[msg_type])?;
    w.write_all(&len.to_be_bytes())?;
    Ok(())
}

fn read_header<R: Read>(r: &mut R) -> std::io::Result<(u8, u32)> {
    let mut type_buf = [0u8; 1];
    r.read_exact(&mut type_buf)?;

    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;

    Ok((type_buf[0], u32::from_be_bytes(len_buf)))
}

fn encode_name(buf: &mut Vec<u8>, name: &str) {
    buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
    buf.extend_from_slice(name.as_bytes());
}

fn decode_name<R: Read>(r: &mut R) -> Result<String, SyncError> {
    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf).map_err(SyncError::Transport)?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut name_buf = vec![0u8; len];
    r.read_exact(&mut name_buf).map_err(SyncError::Transport)?;

    String::from_utf8(name_buf).map_err(|_| SyncError::Protocol {
        message: "file name is not valid UTF-8".to_string(),
    })
}

fn encode_hash_list(buf: &mut Vec<u8>, hash_list: &HashList) {
    match hash_list.blocks() {
        None => buf.push(1),
        Some(hashes) => {
            buf.push(0);
            buf.extend_from_slice(&(hashes.len() as u32).to_be_bytes());
            for hash in hashes {
                buf.extend_from_slice(hash.as_bytes());
            }
        }
    }
}

fn decode_hash_list<R: Read>(r: &mut R) -> Result<HashList, SyncError> {
    let mut flag = [0u8; 1];
    r.read_exact(&mut flag).map_err(SyncError::Transport)?;

    if flag[0] == 1 {
        return Ok(HashList::Tombstone);
    }

    let mut count_buf = [0u8; 4];
    r.read_exact(&mut count_buf).map_err(SyncError::Transport)?;
    let count = u32::from_be_bytes(count_buf) as usize;
    if count == 0 {
        return Err(SyncError::Protocol {
            message: "hash list must never be empty".to_string(),
        });
    }

    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        hashes.push(decode_hash(r)?);
    }
    Ok(HashList::from_blocks(hashes))
}

fn decode_hash<R: Read>(r: &mut R) -> Result<BlockHash, SyncError> {
    let mut hash_buf = [0u8; 32];
    r.read_exact(&mut hash_buf).map_err(SyncError::Transport)?;
    Ok(BlockHash::from_raw(hash_buf))
}

fn encode_record(buf: &mut Vec<u8>, record: &FileMeta) {
    encode_name(buf, &record.file_name);
    buf.extend_from_slice(&record.version.to_be_bytes());
    encode_hash_list(buf, &record.hash_list);
}

fn decode_record<R: Read>(r: &mut R) -> Result<FileMeta, SyncError> {
    let file_name = decode_name(r)?;

    let mut version_buf = [0u8; 8];
    r.read_exact(&mut version_buf).map_err(SyncError::Transport)?;
    let version = u64::from_be_bytes(version_buf);

    let hash_list = decode_hash_list(r)?;
    Ok(FileMeta::new(file_name, version, hash_list))
}

/// Protocol writer for sending messages
pub struct ProtocolWriter<W> {
    inner: W,
}

impl<W: Write> ProtocolWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    fn send_frame(&mut self, msg_type: u8, payload: &[u8]) -> Result<(), SyncError> {
        write_header(&mut self.inner, msg_type, payload.len() as u32)
            .map_err(SyncError::Transport)?;
        self.inner.write_all(payload).map_err(SyncError::Transport)?;
        self.inner.flush().map_err(SyncError::Transport)?;
        Ok(())
    }

    /// Request the full file-name -> record map
    pub fn send_file_info_req(&mut self) -> Result<(), SyncError> {
        self.send_frame(msg::FILE_INFO_REQ, &[])
    }

    /// Respond with all known records
    pub fn send_file_info_resp(&mut self, records: &[FileMeta]) -> Result<(), SyncError> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(records.len() as u32).to_be_bytes());
        for record in records {
            encode_record(&mut payload, record);
        }
        self.send_frame(msg::FILE_INFO_RESP, &payload)
    }

    /// Propose an update under optimistic concurrency
    pub fn send_update_file(
        &mut self,
        file_name: &str,
        expected_version: u64,
        hash_list: &HashList,
    ) -> Result<(), SyncError> {
        let mut payload = Vec::new();
        encode_name(&mut payload, file_name);
        payload.extend_from_slice(&expected_version.to_be_bytes());
        encode_hash_list(&mut payload, hash_list);
        self.send_frame(msg::UPDATE_FILE, &payload)
    }

    /// Acknowledge an accepted proposal with the newly stored version
    pub fn send_update_ok(&mut self, version: u64) -> Result<(), SyncError> {
        self.send_frame(msg::UPDATE_OK, &version.to_be_bytes())
    }

    /// Reject a proposal, returning the authoritative current record
    pub fn send_update_conflict(&mut self, record: &FileMeta) -> Result<(), SyncError> {
        let mut payload = Vec::new();
        encode_record(&mut payload, record);
        self.send_frame(msg::UPDATE_CONFLICT, &payload)
    }

    /// Request a block by digest
    pub fn send_get_block(&mut self, hash: &BlockHash) -> Result<(), SyncError> {
        self.send_frame(msg::GET_BLOCK, hash.as_bytes())
    }

    /// Respond with raw block bytes
    pub fn send_block_data(&mut self, data: &[u8]) -> Result<(), SyncError> {
        self.send_frame(msg::BLOCK_DATA, data)
    }

    /// Store a block (the server computes and returns its digest)
    pub fn send_put_block(&mut self, data: &[u8]) -> Result<(), SyncError> {
        self.send_frame(msg::PUT_BLOCK, data)
    }

    /// Acknowledge a stored block with its digest
    pub fn send_block_stored(&mut self, hash: &BlockHash) -> Result<(), SyncError> {
        self.send_frame(msg::BLOCK_STORED, hash.as_bytes())
    }

    /// Ask which of the given digests the server already holds
    pub fn send_has_blocks(&mut self, hashes: &[BlockHash]) -> Result<(), SyncError> {
        self.send_frame(msg::HAS_BLOCKS, &encode_hashes(hashes))
    }

    /// Respond with the subset of digests already present
    pub fn send_have_blocks(&mut self, hashes: &[BlockHash]) -> Result<(), SyncError> {
        self.send_frame(msg::HAVE_BLOCKS, &encode_hashes(hashes))
    }

    /// Report a failure without dropping the connection
    pub fn send_error(&mut self, kind: ErrorKind, message: &str) -> Result<(), SyncError> {
        let mut payload = Vec::with_capacity(1 + message.len());
        payload.push(kind.to_byte());
        payload.extend_from_slice(message.as_bytes());
        self.send_frame(msg::ERROR, &payload)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn encode_hashes(hashes: &[BlockHash]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + hashes.len() * 32);
    payload.extend_from_slice(&(hashes.len() as u32).to_be_bytes());
    for hash in hashes {
        payload.extend_from_slice(hash.as_bytes());
    }
    payload
}

fn decode_hashes(payload: &[u8]) -> Result<Vec<BlockHash>, SyncError> {
    let mut cursor = Cursor::new(payload);
    let mut count_buf = [0u8; 4];
    cursor
        .read_exact(&mut count_buf)
        .map_err(SyncError::Transport)?;
    let count = u32::from_be_bytes(count_buf) as usize;

    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        hashes.push(decode_hash(&mut cursor)?);
    }
    Ok(hashes)
}

/// Protocol reader for receiving messages
pub struct ProtocolReader<R> {
    inner: R,
}

impl<R: Read> ProtocolReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next message.
    ///
    /// # Errors
    /// Returns `Transport` on I/O failure (including EOF) and `Protocol` on
    /// an unknown or malformed frame.
    pub fn read_message(&mut self) -> Result<Message, SyncError> {
        let (msg_type, len) = read_header(&mut self.inner).map_err(SyncError::Transport)?;

        let mut payload = vec![0u8; len as usize];
        self.inner
            .read_exact(&mut payload)
            .map_err(SyncError::Transport)?;

        match msg_type {
            msg::FILE_INFO_REQ => Ok(Message::FileInfoReq),

            msg::FILE_INFO_RESP => {
                let mut cursor = Cursor::new(&payload[..]);
                let mut count_buf = [0u8; 4];
                cursor
                    .read_exact(&mut count_buf)
                    .map_err(SyncError::Transport)?;
                let count = u32::from_be_bytes(count_buf) as usize;

                let mut records = Vec::with_capacity(count);
                for _ in 0..count {
                    records.push(decode_record(&mut cursor)?);
                }
                Ok(Message::FileInfoResp { records })
            }

            msg::UPDATE_FILE => {
                let mut cursor = Cursor::new(&payload[..]);
                let file_name = decode_name(&mut cursor)?;

                let mut version_buf = [0u8; 8];
                cursor
                    .read_exact(&mut version_buf)
                    .map_err(SyncError::Transport)?;
                let expected_version = u64::from_be_bytes(version_buf);

                let hash_list = decode_hash_list(&mut cursor)?;
                Ok(Message::UpdateFile {
                    file_name,
                    expected_version,
                    hash_list,
                })
            }

            msg::UPDATE_OK => {
                let version_buf: [u8; 8] =
                    payload.as_slice().try_into().map_err(|_| SyncError::Protocol {
                        message: "UpdateOk payload must be 8 bytes".to_string(),
                    })?;
                Ok(Message::UpdateOk {
                    version: u64::from_be_bytes(version_buf),
                })
            }

            msg::UPDATE_CONFLICT => {
                let mut cursor = Cursor::new(&payload[..]);
                let record = decode_record(&mut cursor)?;
                Ok(Message::UpdateConflict { record })
            }

            msg::GET_BLOCK => {
                let mut cursor = Cursor::new(&payload[..]);
                Ok(Message::GetBlock {
                    hash: decode_hash(&mut cursor)?,
                })
            }

            msg::BLOCK_DATA => Ok(Message::BlockData {
                data: Bytes::from(payload),
            }),

            msg::PUT_BLOCK => Ok(Message::PutBlock {
                data: Bytes::from(payload),
            }),

            msg::BLOCK_STORED => {
                let mut cursor = Cursor::new(&payload[..]);
                Ok(Message::BlockStored {
                    hash: decode_hash(&mut cursor)?,
                })
            }

            msg::HAS_BLOCKS => Ok(Message::HasBlocks {
                hashes: decode_hashes(&payload)?,
            }),

            msg::HAVE_BLOCKS => Ok(Message::HaveBlocks {
                hashes: decode_hashes(&payload)?,
            }),

            msg::ERROR => {
                if payload.is_empty() {
                    return Err(SyncError::Protocol {
                        message: "empty Error frame".to_string(),
                    });
                }
                let kind = ErrorKind::from_byte(payload[0]);
                let message = String::from_utf8_lossy(&payload[1..]).to_string();
                Ok(Message::Error { kind, message })
            }

            _ => Err(SyncError::Protocol {
                message: format!("unknown message type: {msg_type:#04x}"),
            }),
        }
    }

    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.inner
    }
}
