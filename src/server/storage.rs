//! Durable storage logging module implementation. Backs the acceptor's
//! promise/accept records with an append-only file.

use std::fmt;
use std::io::SeekFrom;
use std::path::Path;

use crate::utils::SynleaseError;

use serde::{de::DeserializeOwned, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Log action ID type.
pub type LogActionId = u64;

/// Action command to the logger. File cursor will be positioned at EOF after
/// every action.
#[derive(Debug, PartialEq, Eq)]
pub enum LogAction<Ent> {
    /// Read a log entry out.
    Read { offset: usize },

    /// Append a log entry to EOF.
    Append { entry: Ent, sync: bool },

    /// Truncate the log at given offset, keeping the head part.
    Truncate { offset: usize },
}

/// Action result returned by the logger.
#[derive(Debug, PartialEq, Eq)]
pub enum LogResult<Ent> {
    /// `Some(entry)` if successful, else `None`.
    Read {
        entry: Option<Ent>,
        end_offset: usize,
    },

    /// `now_size` is the size of file after this.
    Append { now_size: usize },

    /// `offset_ok` is true if truncate successful, else false. `now_size` is
    /// the size of file after this.
    Truncate { offset_ok: bool, now_size: usize },
}

/// What the logger sends back per action; failed actions are acked too, so
/// that a requester never waits forever.
type LogAck<Ent> = Result<LogResult<Ent>, String>;

/// Durable storage logging module.
pub(crate) struct StorageHub<Ent> {
    /// Sender side of the log channel.
    tx_log: mpsc::UnboundedSender<(LogActionId, LogAction<Ent>)>,

    /// Receiver side of the ack channel.
    rx_ack: mpsc::UnboundedReceiver<(LogActionId, LogAck<Ent>)>,

    /// Next action ID handed out by `do_sync_action()`.
    next_id: LogActionId,

    /// Join handle of the logger thread.
    _logger_handle: JoinHandle<()>,
}

// StorageHub public API implementation
impl<Ent> StorageHub<Ent>
where
    Ent: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a new durable storage logging hub. Spawns the logger thread.
    /// Creates a log channel for submitting logging actions to the logger and
    /// an ack channel for getting results. Prepares the given backing file as
    /// durability backend.
    pub(crate) async fn new_and_setup(
        path: &Path,
    ) -> Result<Self, SynleaseError> {
        // prepare backing file
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_info!("created backer file '{}'", path.display());
        } else {
            pf_info!("backer file '{}' already exists", path.display());
        }
        let mut backer_file =
            OpenOptions::new().read(true).write(true).open(path).await?;
        let file_size = backer_file.seek(SeekFrom::End(0)).await? as usize;

        let (tx_log, rx_log) = mpsc::unbounded_channel();
        let (tx_ack, rx_ack) = mpsc::unbounded_channel();

        let logger_handle = tokio::spawn(Self::logger_thread(
            backer_file,
            file_size,
            rx_log,
            tx_ack,
        ));

        Ok(StorageHub {
            tx_log,
            rx_ack,
            next_id: 0,
            _logger_handle: logger_handle,
        })
    }

    /// Submits an action by sending it to the log channel.
    pub(crate) fn submit_action(
        &mut self,
        id: LogActionId,
        action: LogAction<Ent>,
    ) -> Result<(), SynleaseError> {
        self.tx_log
            .send((id, action))
            .map_err(|e| SynleaseError::msg(e.to_string()))
    }

    /// Waits for the next logging result by receiving from the ack channel.
    /// A failed action surfaces as `Err`.
    pub(crate) async fn get_result(
        &mut self,
    ) -> Result<(LogActionId, LogResult<Ent>), SynleaseError> {
        match self.rx_ack.recv().await {
            Some((id, Ok(result))) => Ok((id, result)),
            Some((id, Err(e))) => Err(SynleaseError::msg(format!(
                "logging action {} failed: {}",
                id, e
            ))),
            None => logged_err!("ack channel has been closed"),
        }
    }

    /// Submits an action and waits for its own result. Must not be mixed
    /// with outstanding `submit_action()` calls whose results are unread.
    pub(crate) async fn do_sync_action(
        &mut self,
        action: LogAction<Ent>,
    ) -> Result<LogResult<Ent>, SynleaseError> {
        let id = self.next_id;
        self.next_id += 1;
        self.submit_action(id, action)?;
        let (ack_id, result) = self.get_result().await?;
        if ack_id != id {
            return logged_err!(
                "log result id mismatch: expect {} got {}",
                id,
                ack_id
            );
        }
        Ok(result)
    }

    /// Kills the logger thread, so that every later action fails.
    #[cfg(test)]
    pub(crate) async fn stop_logger(&self) {
        self._logger_handle.abort();
        while !self._logger_handle.is_finished() {
            tokio::task::yield_now().await;
        }
    }
}

// StorageHub logger thread implementation
impl<Ent> StorageHub<Ent>
where
    Ent: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Read out entry at given offset.
    async fn read_entry(
        backer: &mut File,
        file_size: usize,
        offset: usize,
    ) -> Result<(Option<Ent>, usize), SynleaseError> {
        if offset + 8 > file_size {
            if offset < file_size {
                // offset == file_size is the normal end of a replay
                pf_warn!(
                    "read header end offset {} out of file bound {}",
                    offset + 8,
                    file_size
                );
            }
            return Ok((None, offset));
        }

        // read entry length header
        backer.seek(SeekFrom::Start(offset as u64)).await?;
        let entry_len = backer.read_u64().await? as usize;
        let offset_e = offset + 8 + entry_len;
        if offset_e > file_size {
            pf_warn!("read entry invalid length {}", entry_len);
            backer.seek(SeekFrom::End(0)).await?; // recover cursor to EOF
            return Ok((None, offset));
        }

        // read entry content
        let mut entry_buf: Vec<u8> = vec![0; entry_len];
        backer.read_exact(&mut entry_buf[..]).await?;
        let entry = decode_from_slice(&entry_buf)?;
        backer.seek(SeekFrom::End(0)).await?; // recover cursor to EOF
        Ok((Some(entry), offset_e))
    }

    /// Append given entry to EOF.
    async fn append_entry(
        backer: &mut File,
        file_size: usize,
        entry: &Ent,
        sync: bool,
    ) -> Result<usize, SynleaseError> {
        let entry_bytes = encode_to_vec(entry)?;
        let entry_len = entry_bytes.len();

        // length header and content go out in one write
        let mut frame = Vec::with_capacity(8 + entry_len);
        frame.extend_from_slice(&(entry_len as u64).to_be_bytes());
        frame.extend_from_slice(&entry_bytes[..]);
        if let Err(e) = Self::write_frame(backer, &frame, sync).await {
            pf_warn!("append failed, rolling back to offset {}", file_size);
            Self::discard_tail(backer, file_size).await?;
            return Err(e);
        }

        Ok(file_size + 8 + entry_len)
    }

    /// Writes one encoded frame at the current cursor.
    async fn write_frame(
        backer: &mut File,
        frame: &[u8],
        sync: bool,
    ) -> Result<(), SynleaseError> {
        backer.write_all(frame).await?;
        backer.flush().await?;
        if sync {
            backer.sync_data().await?;
        }
        Ok(())
    }

    /// Drops any bytes past `file_size` left by a partially written frame,
    /// leaving the cursor at the new EOF.
    async fn discard_tail(
        backer: &mut File,
        file_size: usize,
    ) -> Result<(), SynleaseError> {
        backer.set_len(file_size as u64).await?;
        backer.seek(SeekFrom::Start(file_size as u64)).await?;
        backer.sync_all().await?;
        Ok(())
    }

    /// Truncate the file at given offset, keeping the head part.
    async fn truncate_log(
        backer: &mut File,
        file_size: usize,
        offset: usize,
    ) -> Result<(bool, usize), SynleaseError> {
        if offset > file_size {
            pf_warn!(
                "truncate offset {} exceeds file end {}",
                offset,
                file_size
            );
            Ok((false, file_size))
        } else {
            backer.set_len(offset as u64).await?;
            backer.seek(SeekFrom::End(0)).await?; // recover cursor to EOF
            backer.sync_all().await?;
            Ok((true, offset))
        }
    }

    /// Carry out the given action on logger.
    async fn do_action(
        backer: &mut File,
        file_size: &mut usize,
        action: LogAction<Ent>,
    ) -> Result<LogResult<Ent>, SynleaseError> {
        match action {
            LogAction::Read { offset } => {
                Self::read_entry(backer, *file_size, offset).await.map(
                    |(entry, end_offset)| LogResult::Read { entry, end_offset },
                )
            }
            LogAction::Append { entry, sync } => {
                let now_size =
                    Self::append_entry(backer, *file_size, &entry, sync)
                        .await?;
                *file_size = now_size;
                Ok(LogResult::Append { now_size })
            }
            LogAction::Truncate { offset } => {
                let (offset_ok, now_size) =
                    Self::truncate_log(backer, *file_size, offset).await?;
                *file_size = now_size;
                Ok(LogResult::Truncate {
                    offset_ok,
                    now_size,
                })
            }
        }
    }

    /// Logger thread function.
    async fn logger_thread(
        mut backer: File,
        mut file_size: usize,
        mut rx_log: mpsc::UnboundedReceiver<(LogActionId, LogAction<Ent>)>,
        tx_ack: mpsc::UnboundedSender<(LogActionId, LogAck<Ent>)>,
    ) {
        pf_debug!("logger thread spawned");

        while let Some((id, action)) = rx_log.recv().await {
            let ack = match Self::do_action(&mut backer, &mut file_size, action)
                .await
            {
                Ok(result) => Ok(result),
                Err(e) => {
                    pf_error!("error during logging action {}: {}", id, e);
                    Err(e.to_string())
                }
            };
            if tx_ack.send((id, ack)).is_err() {
                pf_error!("error sending to tx_ack");
            }
        }

        // channel gets closed and no messages remain
        pf_debug!("logger thread exitted");
    }
}
