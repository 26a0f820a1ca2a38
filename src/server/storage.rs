//! Bet persistence: the append/load store trait and its two backings.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::protocol::Bet;
use crate::utils::TallyError;

/// Append-only bet persistence. Single writer; bets come back out of
/// `load_all()` in the order they went in.
#[async_trait]
pub trait BetStore: Send {
    /// Persists the given bets after every previously appended one.
    async fn append(&mut self, bets: &[Bet]) -> Result<(), TallyError>;

    /// Loads every persisted bet in insertion order.
    async fn load_all(&mut self) -> Result<Vec<Bet>, TallyError>;
}

/// Volatile in-memory bet store.
#[derive(Debug, Default)]
pub struct MemoryBetStore {
    bets: Vec<Bet>,
}

impl MemoryBetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BetStore for MemoryBetStore {
    async fn append(&mut self, bets: &[Bet]) -> Result<(), TallyError> {
        self.bets.extend_from_slice(bets);
        Ok(())
    }

    async fn load_all(&mut self) -> Result<Vec<Bet>, TallyError> {
        Ok(self.bets.clone())
    }
}

/// Durable bet store backed by a log file. Each bet is one record: an 8-byte
/// big-endian length header followed by the MessagePack-encoded bet. The
/// file cursor is kept at EOF between calls.
#[derive(Debug)]
pub struct FileBetStore {
    /// Path to backing file.
    path: PathBuf,

    /// Backing file handle.
    backer: File,

    /// Current file size in bytes.
    file_size: usize,

    /// Whether to call `fdatasync()` after every appended batch.
    sync: bool,
}

impl FileBetStore {
    /// Opens the backing file, creating it if missing and truncating any
    /// bets left over from a previous draw.
    pub async fn new_and_setup(
        path: &Path,
        sync: bool,
    ) -> Result<Self, TallyError> {
        let backer = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        pf_info!("bet log file '{}' ready", path.display());

        Ok(FileBetStore {
            path: path.to_path_buf(),
            backer,
            file_size: 0,
            sync,
        })
    }

    /// Reads the record at `offset`. Returns the bet and the offset right
    /// after it, or `None` if no complete record starts there.
    async fn read_record(
        &mut self,
        offset: usize,
    ) -> Result<Option<(Bet, usize)>, TallyError> {
        if offset + 8 > self.file_size {
            if offset < self.file_size {
                pf_warn!(
                    "torn record header at offset {} of '{}'",
                    offset,
                    self.path.display()
                );
            }
            return Ok(None);
        }

        self.backer.seek(SeekFrom::Start(offset as u64)).await?;
        let record_len = self.backer.read_u64().await? as usize;
        let offset_e = offset + 8 + record_len;
        if offset_e > self.file_size {
            pf_warn!(
                "torn record of length {} at offset {} of '{}'",
                record_len,
                offset,
                self.path.display()
            );
            return Ok(None);
        }

        let mut record_buf: Vec<u8> = vec![0; record_len];
        self.backer.read_exact(&mut record_buf[..]).await?;
        let bet = decode_from_slice(&record_buf)?;
        Ok(Some((bet, offset_e)))
    }
}

#[async_trait]
impl BetStore for FileBetStore {
    async fn append(&mut self, bets: &[Bet]) -> Result<(), TallyError> {
        let mut bytes = Vec::new();
        for bet in bets {
            let record = encode_to_vec(bet)?;
            bytes.extend_from_slice(&(record.len() as u64).to_be_bytes());
            bytes.extend_from_slice(&record);
        }

        self.backer.write_all(&bytes).await?;
        if self.sync {
            self.backer.sync_data().await?;
        }
        self.file_size += bytes.len();
        Ok(())
    }

    async fn load_all(&mut self) -> Result<Vec<Bet>, TallyError> {
        self.backer.flush().await?;
        let mut bets = vec![];
        let mut offset = 0;
        while let Some((bet, next_offset)) = self.read_record(offset).await? {
            bets.push(bet);
            offset = next_offset;
        }
        self.backer.seek(SeekFrom::End(0)).await?; // recover cursor to EOF
        Ok(bets)
    }
}
