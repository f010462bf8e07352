//! JSON-lines journal backing a durable transaction log.
//!
//! Each line holds everything one transaction committed, so a torn write
//! loses a whole transaction and never half of one.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::StoreError;
use crate::model::{Entitlement, LedgerEntry};

#[derive(Debug, Serialize)]
struct RecordRef<'a> {
    entries: &'a [LedgerEntry],
    entitlements: &'a [Entitlement],
}

/// One committed transaction as read back from disk.
#[derive(Debug, Deserialize)]
pub(crate) struct JournalRecord {
    #[serde(default)]
    pub entries: Vec<LedgerEntry>,
    #[serde(default)]
    pub entitlements: Vec<Entitlement>,
}

#[derive(Debug)]
pub(crate) struct Journal {
    file: File,
    path: PathBuf,
}

impl Journal {
    /// Open (or create) the journal and return its records in commit order,
    /// paired with their 1-based line numbers.
    ///
    /// A torn final line is truncated away. Any other unreadable line is an error.
    pub async fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<(usize, JournalRecord)>), StoreError> {
        let path = path.as_ref().to_path_buf();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        let mut good_len = 0usize;
        let mut offset = 0usize;
        let mut torn = false;

        for (idx, chunk) in bytes.split_inclusive(|b| *b == b'\n').enumerate() {
            let line = idx + 1;
            offset += chunk.len();
            let complete = chunk.ends_with(b"\n");
            let body = chunk.strip_suffix(b"\n").unwrap_or(chunk);

            if complete && body.iter().all(u8::is_ascii_whitespace) {
                good_len = offset;
                continue;
            }

            match serde_json::from_slice::<JournalRecord>(body) {
                Ok(record) if complete => {
                    records.push((line, record));
                    good_len = offset;
                }
                // Only the last line can be missing its newline.
                Ok(_) => torn = true,
                Err(_) if !complete => torn = true,
                Err(source) => return Err(StoreError::Corrupt { line, source }),
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        if torn {
            warn!(
                path = %path.display(),
                kept_bytes = good_len,
                dropped_bytes = bytes.len() - good_len,
                "truncating torn journal tail"
            );
            file.set_len(good_len as u64).await?;
        }

        Ok((Self { file, path }, records))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append one transaction's writes.
    pub async fn append(
        &mut self,
        entries: &[LedgerEntry],
        entitlements: &[Entitlement],
    ) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(&RecordRef {
            entries,
            entitlements,
        })
        .map_err(StoreError::Encode)?;
        line.push(b'\n');

        self.file.write_all(&line).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }
}
