//! blocksync-server: the coordinator
//!
//! Accepts TCP connections and serves block and metadata operations over
//! the framed binary protocol. All state lives in an explicit
//! [`ServerState`] shared by every connection handler; the metadata store's
//! compare-and-swap is the only write path for versions.

use std::io::{BufReader, BufWriter};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use blocksync_core::error::SyncError;
use blocksync_core::meta::UpdateOutcome;
use blocksync_core::protocol::{ErrorKind, Message, ProtocolReader, ProtocolWriter};
use blocksync_core::store::{BlockStore, MetaStore};

/// Shared server state, one instance per process
pub struct ServerState {
    blocks: BlockStore,
    meta: MetaStore,
    block_size: u32,
}

impl ServerState {
    /// Open (or create) the stores under `data_dir`.
    ///
    /// # Errors
    /// Returns an error if either store cannot be opened.
    pub fn open(data_dir: &Path, block_size: u32) -> Result<Self, SyncError> {
        let blocks = BlockStore::open(&data_dir.join("blocks"))?;
        let meta = MetaStore::open(&data_dir.join("meta"))?;

        let stats = blocks.stats()?;
        info!(
            "stores open: {} block(s), {} byte(s), block size {block_size}",
            stats.count, stats.total_bytes
        );

        Ok(Self {
            blocks,
            meta,
            block_size,
        })
    }
}

/// Accept connections forever, one handler thread per client.
///
/// # Errors
/// Returns an error if accepting fails.
pub fn serve(listener: TcpListener, state: Arc<ServerState>) -> color_eyre::Result<()> {
    info!("listening on {}", listener.local_addr()?);

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!("accept failed: {err}");
                continue;
            }
        };
        let state = Arc::clone(&state);
        std::thread::spawn(move || {
            let peer = stream
                .peer_addr()
                .map_or_else(|_| "<unknown>".to_string(), |addr| addr.to_string());
            debug!("client connected: {peer}");
            if let Err(err) = handle_connection(stream, &state) {
                // EOF when the client hangs up lands here too
                debug!("client {peer} disconnected: {err}");
            }
        });
    }

    Ok(())
}

/// Serve one client session until it disconnects.
///
/// Failures of individual operations are reported as `Error` frames and do
/// not end the session; only transport failures (including EOF) do.
///
/// # Errors
/// Returns an error when the connection is closed or unusable.
pub fn handle_connection(stream: TcpStream, state: &ServerState) -> Result<(), SyncError> {
    stream.set_nodelay(true).map_err(SyncError::Transport)?;
    let read_half = stream.try_clone().map_err(SyncError::Transport)?;

    let mut reader = ProtocolReader::new(BufReader::new(read_half));
    let mut writer = ProtocolWriter::new(BufWriter::new(stream));

    loop {
        let message = reader.read_message()?;
        if let Err(err) = handle_message(state, message, &mut writer) {
            match err {
                // The reply failed: the connection is gone
                SyncError::Transport(err) => return Err(SyncError::Transport(err)),
                SyncError::NotFound { what } => {
                    warn!("request failed: not found: {what}");
                    writer.send_error(ErrorKind::NotFound, &what)?;
                }
                err => {
                    warn!("request failed: {err}");
                    writer.send_error(ErrorKind::Generic, &err.to_string())?;
                }
            }
        }
    }
}

fn handle_message<W: std::io::Write>(
    state: &ServerState,
    message: Message,
    writer: &mut ProtocolWriter<W>,
) -> Result<(), SyncError> {
    match message {
        Message::FileInfoReq => {
            let records = state.meta.list()?;
            writer.send_file_info_resp(&records)
        }

        Message::UpdateFile {
            file_name,
            expected_version,
            hash_list,
        } => {
            if !blocksync_core::meta::is_sync_name(&file_name) {
                return Err(SyncError::Protocol {
                    message: format!("invalid file name {file_name:?}"),
                });
            }

            // A proposal is only valid once every block it names is stored
            if let Some(hashes) = hash_list.blocks() {
                for hash in hashes {
                    if !state.blocks.has(hash)? {
                        return Err(SyncError::not_found(format!(
                            "block {hash} named by {file_name}"
                        )));
                    }
                }
            }

            match state.meta.propose(&file_name, expected_version, &hash_list)? {
                UpdateOutcome::Accepted { version } => {
                    debug!("{file_name}: accepted version {version}");
                    writer.send_update_ok(version)
                }
                UpdateOutcome::Rejected { current } => {
                    debug!(
                        "{file_name}: rejected proposal over version {expected_version}, \
                         current is {}",
                        current.version
                    );
                    writer.send_update_conflict(&current)
                }
            }
        }

        Message::GetBlock { hash } => {
            let data = state.blocks.get(&hash)?;
            writer.send_block_data(&data)
        }

        Message::PutBlock { data } => {
            if data.len() > state.block_size as usize {
                return Err(SyncError::Protocol {
                    message: format!(
                        "block of {} bytes exceeds block size {}",
                        data.len(),
                        state.block_size
                    ),
                });
            }
            let hash = state.blocks.put(&data)?;
            writer.send_block_stored(&hash)
        }

        Message::HasBlocks { hashes } => {
            let present = state.blocks.present(&hashes)?;
            writer.send_have_blocks(&present)
        }

        // Responses; a client must never send these
        Message::FileInfoResp { .. }
        | Message::UpdateOk { .. }
        | Message::UpdateConflict { .. }
        | Message::BlockData { .. }
        | Message::BlockStored { .. }
        | Message::HaveBlocks { .. }
        | Message::Error { .. } => Err(SyncError::Protocol {
            message: "unexpected message type from client".to_string(),
        }),
    }
}
