//! Per-epoch checkpoints and the log directory that holds them.
//!
//! Each completed epoch is written to `<log_root>/checkpoint_epoch_<epoch>.ckpt`:
//!
//! ```text
//! b"HCCRCKPT" | header_len: u32 LE | JSON header | model state | optimizer state
//! ```
//!
//! The header carries the epoch, loss, learning rate and the byte length of
//! each state blob. The blobs are Burn records serialized with
//! [`BinBytesRecorder`]; this module treats them as opaque bytes.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use burn::record::{BinBytesRecorder, FullPrecisionSettings, Record, Recorder};
use burn::tensor::backend::Backend;
use hccr_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const MAGIC: &[u8; 8] = b"HCCRCKPT";
const FORMAT_VERSION: u32 = 1;
const FILE_PREFIX: &str = "checkpoint_epoch_";
const FILE_SUFFIX: &str = ".ckpt";

/// Trainable state after one completed epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub epoch: usize,
    /// Loss of the final batch of the epoch
    pub loss: f64,
    /// Learning rate after the epoch's scheduler step
    pub learning_rate: f64,
    pub model_state: Vec<u8>,
    pub optimizer_state: Vec<u8>,
    /// RFC 3339 creation time
    pub created_at: String,
}

impl Checkpoint {
    pub fn new(
        epoch: usize,
        loss: f64,
        learning_rate: f64,
        model_state: Vec<u8>,
        optimizer_state: Vec<u8>,
    ) -> Self {
        Self {
            epoch,
            loss,
            learning_rate,
            model_state,
            optimizer_state,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Serializes to the on-disk layout.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header = Header {
            format_version: FORMAT_VERSION,
            epoch: self.epoch,
            loss: self.loss,
            learning_rate: self.learning_rate,
            model_state_len: self.model_state.len() as u64,
            optimizer_state_len: self.optimizer_state.len() as u64,
            created_at: self.created_at.clone(),
        };
        let header = serde_json::to_vec(&header)?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| Error::Serialization("checkpoint header too large".into()))?;

        let mut bytes = Vec::with_capacity(
            MAGIC.len() + 4 + header.len() + self.model_state.len() + self.optimizer_state.len(),
        );
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&header_len.to_le_bytes());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&self.model_state);
        bytes.extend_from_slice(&self.optimizer_state);
        Ok(bytes)
    }

    /// Parses the on-disk layout; `path` is only used in error messages.
    pub fn from_bytes(bytes: &[u8], path: &Path) -> Result<Self> {
        let corrupt = |reason: &str| Error::corrupt_checkpoint(path, reason);

        let rest = bytes
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| corrupt("missing checkpoint magic"))?;
        if rest.len() < 4 {
            return Err(corrupt("truncated header length"));
        }
        let (len_bytes, rest) = rest.split_at(4);
        let header_len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
            as usize;
        if rest.len() < header_len {
            return Err(corrupt("truncated header"));
        }
        let (header, body) = rest.split_at(header_len);

        let header: Header = serde_json::from_slice(header)
            .map_err(|e| corrupt(&format!("invalid header: {e}")))?;
        if header.format_version != FORMAT_VERSION {
            return Err(corrupt(&format!(
                "unsupported format version {}",
                header.format_version
            )));
        }

        let model_len = usize::try_from(header.model_state_len)
            .map_err(|_| corrupt("model state length overflows"))?;
        let optimizer_len = usize::try_from(header.optimizer_state_len)
            .map_err(|_| corrupt("optimizer state length overflows"))?;
        let expected = model_len
            .checked_add(optimizer_len)
            .ok_or_else(|| corrupt("state lengths overflow"))?;

        if body.len() < expected {
            return Err(corrupt(&format!(
                "truncated state: expected {expected} bytes, found {}",
                body.len()
            )));
        }
        if body.len() > expected {
            return Err(corrupt(&format!(
                "{} trailing bytes after state",
                body.len() - expected
            )));
        }

        let (model_state, optimizer_state) = body.split_at(model_len);
        Ok(Self {
            epoch: header.epoch,
            loss: header.loss,
            learning_rate: header.learning_rate,
            model_state: model_state.to_vec(),
            optimizer_state: optimizer_state.to_vec(),
            created_at: header.created_at,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    format_version: u32,
    epoch: usize,
    #[serde(with = "f64_bits")]
    loss: f64,
    #[serde(with = "f64_bits")]
    learning_rate: f64,
    model_state_len: u64,
    optimizer_state_len: u64,
    #[serde(default)]
    created_at: String,
}

/// Stores an `f64` as its IEEE 754 bit pattern; JSON has no NaN or infinity.
mod f64_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.to_bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        u64::deserialize(deserializer).map(f64::from_bits)
    }
}

/// Reads and writes checkpoints in one log directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    log_root: PathBuf,
}

impl CheckpointStore {
    pub fn new(log_root: impl Into<PathBuf>) -> Self {
        Self {
            log_root: log_root.into(),
        }
    }

    pub fn log_root(&self) -> &Path {
        &self.log_root
    }

    pub fn path_for(&self, epoch: usize) -> PathBuf {
        self.log_root.join(format!("{FILE_PREFIX}{epoch}{FILE_SUFFIX}"))
    }

    /// Checkpoints present in the log root, ascending by epoch. Files that do
    /// not follow the naming scheme are ignored. A missing directory is empty;
    /// any other failure to read it is an error.
    pub fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        let entries = match fs::read_dir(&self.log_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut checkpoints = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let epoch = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(extract_epoch_from_filename);
            if let Some(epoch) = epoch {
                checkpoints.push((epoch, path));
            }
        }

        checkpoints.sort_by_key(|(epoch, _)| *epoch);
        Ok(checkpoints)
    }

    /// `false` also when the directory cannot be read; use [`Self::list`] to
    /// see the error.
    pub fn exists_any(&self) -> bool {
        self.list().map(|c| !c.is_empty()).unwrap_or(false)
    }

    /// Path of the checkpoint with the highest epoch number.
    pub fn find_latest(&self) -> Result<PathBuf> {
        self.list()?
            .pop()
            .map(|(_, path)| path)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "No checkpoint found in {}",
                    self.log_root.display()
                ))
            })
    }

    pub fn load(&self, path: &Path) -> Result<Checkpoint> {
        let bytes = fs::read(path)?;
        let checkpoint = Checkpoint::from_bytes(&bytes, path)?;
        info!(
            "Loaded checkpoint for epoch {} from {}",
            checkpoint.epoch,
            path.display()
        );
        Ok(checkpoint)
    }

    pub fn load_latest(&self) -> Result<Checkpoint> {
        let path = self.find_latest()?;
        self.load(&path)
    }

    /// Writes the checkpoint, replacing any existing file for the same epoch.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        fs::create_dir_all(&self.log_root)?;
        let path = self.path_for(checkpoint.epoch);
        let bytes = checkpoint.to_bytes()?;
        fs::write(&path, &bytes)?;

        info!(
            "Checkpoint saved to {} ({} bytes)",
            path.display(),
            bytes.len()
        );
        Ok(path)
    }
}

/// Epoch number encoded in a checkpoint file name.
pub fn extract_epoch_from_filename(filename: &str) -> Option<usize> {
    filename
        .strip_prefix(FILE_PREFIX)
        .and_then(|s| s.strip_suffix(FILE_SUFFIX))
        .and_then(|s| s.parse().ok())
}

fn recorder() -> BinBytesRecorder<FullPrecisionSettings> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
}

/// Serializes a Burn record (module or optimizer) to bytes.
pub fn record_to_bytes<B: Backend, R: Record<B>>(record: R) -> Result<Vec<u8>> {
    let bytes = Recorder::<B>::record(&recorder(), record, ())
        .map_err(|e| Error::Serialization(format!("Failed to encode record: {e}")))?;
    debug!("Encoded record ({} bytes)", bytes.len());
    Ok(bytes)
}

/// Restores a Burn record from bytes written by [`record_to_bytes`].
pub fn record_from_bytes<B: Backend, R: Record<B>>(bytes: Vec<u8>, device: &B::Device) -> Result<R> {
    Recorder::<B>::load(&recorder(), bytes, device)
        .map_err(|e| Error::Serialization(format!("Failed to decode record: {e}")))
}
