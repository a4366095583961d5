//! TCP RPC client for the coordinator
//!
//! One connection per sync pass; every call is a request frame followed by
//! exactly one response frame. An `Error` frame from the server is mapped
//! back into the client-side error taxonomy.

use std::collections::{HashMap, HashSet};
use std::io::{BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};

use bytes::Bytes;
use tracing::debug;

use blocksync_core::error::SyncError;
use blocksync_core::hash::BlockHash;
use blocksync_core::meta::{FileMeta, HashList, UpdateOutcome};
use blocksync_core::protocol::{ErrorKind, Message, ProtocolReader, ProtocolWriter};
use blocksync_core::Coordinator;

/// Coordinator client over a TCP connection
pub struct TcpCoordinator {
    reader: ProtocolReader<BufReader<TcpStream>>,
    writer: ProtocolWriter<BufWriter<TcpStream>>,
}

impl TcpCoordinator {
    /// Connect to a coordinator at `addr` (e.g. `127.0.0.1:9090`).
    ///
    /// # Errors
    /// Returns `Transport` if the connection cannot be established.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, SyncError> {
        let stream = TcpStream::connect(addr).map_err(SyncError::Transport)?;
        stream.set_nodelay(true).map_err(SyncError::Transport)?;

        let read_half = stream.try_clone().map_err(SyncError::Transport)?;
        debug!("connected to coordinator");

        Ok(Self {
            reader: ProtocolReader::new(BufReader::new(read_half)),
            writer: ProtocolWriter::new(BufWriter::new(stream)),
        })
    }

    /// Read one response frame, converting server-reported errors.
    fn read_response(&mut self) -> Result<Message, SyncError> {
        match self.reader.read_message()? {
            Message::Error { kind, message } => Err(match kind {
                ErrorKind::NotFound => SyncError::not_found(message),
                ErrorKind::Generic => SyncError::Protocol { message },
            }),
            message => Ok(message),
        }
    }
}

impl Coordinator for TcpCoordinator {
    fn file_info_map(&mut self) -> Result<HashMap<String, FileMeta>, SyncError> {
        self.writer.send_file_info_req()?;
        match self.read_response()? {
            Message::FileInfoResp { records } => Ok(records
                .into_iter()
                .map(|record| (record.file_name.clone(), record))
                .collect()),
            other => Err(unexpected("FileInfoResp", &other)),
        }
    }

    fn update_file(
        &mut self,
        file_name: &str,
        expected_version: u64,
        hash_list: &HashList,
    ) -> Result<UpdateOutcome, SyncError> {
        self.writer
            .send_update_file(file_name, expected_version, hash_list)?;
        match self.read_response()? {
            Message::UpdateOk { version } => Ok(UpdateOutcome::Accepted { version }),
            Message::UpdateConflict { record } => Ok(UpdateOutcome::Rejected { current: record }),
            other => Err(unexpected("UpdateOk or UpdateConflict", &other)),
        }
    }

    fn get_block(&mut self, hash: &BlockHash) -> Result<Bytes, SyncError> {
        self.writer.send_get_block(hash)?;
        match self.read_response()? {
            Message::BlockData { data } => Ok(data),
            other => Err(unexpected("BlockData", &other)),
        }
    }

    fn put_block(&mut self, data: &[u8]) -> Result<BlockHash, SyncError> {
        self.writer.send_put_block(data)?;
        match self.read_response()? {
            Message::BlockStored { hash } => Ok(hash),
            other => Err(unexpected("BlockStored", &other)),
        }
    }

    fn has_blocks(&mut self, hashes: &[BlockHash]) -> Result<HashSet<BlockHash>, SyncError> {
        self.writer.send_has_blocks(hashes)?;
        match self.read_response()? {
            Message::HaveBlocks { hashes } => Ok(hashes.into_iter().collect()),
            other => Err(unexpected("HaveBlocks", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Message) -> SyncError {
    SyncError::Protocol {
        message: format!("expected {expected}, got {got:?}"),
    }
}
