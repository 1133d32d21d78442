/*!
Local filesystem process store.
*/

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::ProcessStore;
use crate::compression::{envelope_compressor, CompressionAdapter};
use crate::{AipError, ProcessEnvelope, ProcessId, Result};

/// One file per process below a base directory
///
/// Files are named `process-<id>.json`, with `.gz` appended when compressed.
/// Every write goes to a temporary file in the same directory first and is
/// then renamed into place, so readers never see a half-written envelope.
///
/// # Example
/// ```rust,no_run
/// use aip_core::FileProcessStore;
///
/// let store = FileProcessStore::new("/var/lib/aip/processes")?;
/// # Ok::<(), aip_core::AipError>(())
/// ```
pub struct FileProcessStore {
    base_dir: PathBuf,
    compressor: Box<dyn CompressionAdapter>,
}

impl FileProcessStore {
    /// Create a gzip-compressing store, creating `base_dir` if necessary
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        Self::with_compression(base_dir, true)
    }

    /// Create a store with compression switched on or off
    pub fn with_compression<P: AsRef<Path>>(base_dir: P, compress: bool) -> Result<Self> {
        Self::with_compressor(base_dir, envelope_compressor(compress))
    }

    pub fn with_compressor<P: AsRef<Path>>(
        base_dir: P,
        compressor: Box<dyn CompressionAdapter>,
    ) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).map_err(|e| {
            AipError::storage(format!(
                "Failed to create directory {}: {}",
                base_dir.display(),
                e
            ))
        })?;
        Ok(Self {
            base_dir,
            compressor,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Full path of the envelope file for `id`
    pub fn path_for(&self, id: ProcessId) -> PathBuf {
        self.base_dir.join(format!(
            "{}{}",
            ProcessEnvelope::file_name(id),
            self.compressor.file_extension()
        ))
    }

    /// Ids of all envelope files, whatever their compression
    fn stored_ids(&self) -> Result<Vec<ProcessId>> {
        let entries = fs::read_dir(&self.base_dir).map_err(|e| {
            AipError::storage(format!(
                "Failed to list {}: {}",
                self.base_dir.display(),
                e
            ))
        })?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(parse_file_name) {
                ids.push(id);
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn encode(&self, envelope: &ProcessEnvelope) -> Result<Vec<u8>> {
        let json = serde_json::to_vec_pretty(envelope)?;
        self.compressor.compress(&json)
    }

    fn write_temp(&self, envelope: &ProcessEnvelope) -> Result<NamedTempFile> {
        let data = self.encode(envelope)?;
        let mut temp = NamedTempFile::new_in(&self.base_dir)?;
        temp.write_all(&data)?;
        temp.as_file().sync_all()?;
        Ok(temp)
    }
}

fn parse_file_name(name: &str) -> Option<ProcessId> {
    let rest = name.strip_prefix("process-")?;
    let digits = rest
        .strip_suffix(".json.gz")
        .or_else(|| rest.strip_suffix(".json"))?;
    digits.parse().ok().and_then(ProcessId::new)
}

impl ProcessStore for FileProcessStore {
    fn next_id(&self) -> Result<ProcessId> {
        match self.stored_ids()?.last() {
            Some(highest) => Ok(highest.next()),
            None => ProcessId::new(1).ok_or_else(|| AipError::storage("invalid first id")),
        }
    }

    fn insert(&self, envelope: &ProcessEnvelope) -> Result<()> {
        let path = self.path_for(envelope.id);
        let temp = self.write_temp(envelope)?;
        temp.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == io::ErrorKind::AlreadyExists {
                AipError::AlreadyExists(envelope.id)
            } else {
                AipError::storage(format!(
                    "Failed to write process to {}: {}",
                    path.display(),
                    e.error
                ))
            }
        })?;
        tracing::debug!(process_id = envelope.id.get(), path = %path.display(), "Inserted process");
        Ok(())
    }

    fn update(&self, envelope: &ProcessEnvelope) -> Result<()> {
        let path = self.path_for(envelope.id);
        if !path.exists() {
            return Err(AipError::NotFound(envelope.id));
        }
        let temp = self.write_temp(envelope)?;
        temp.persist(&path).map_err(|e| {
            AipError::storage(format!(
                "Failed to write process to {}: {}",
                path.display(),
                e.error
            ))
        })?;
        tracing::debug!(process_id = envelope.id.get(), path = %path.display(), "Updated process");
        Ok(())
    }

    fn load(&self, id: ProcessId) -> Result<ProcessEnvelope> {
        let path = self.path_for(id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(AipError::NotFound(id)),
            Err(e) => {
                return Err(AipError::storage(format!(
                    "Failed to read process from {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let json = self.compressor.decompress(&data)?;
        let envelope: ProcessEnvelope = serde_json::from_slice(&json)?;
        if envelope.id != id {
            return Err(AipError::invalid_format(format!(
                "{} holds process [{}]",
                path.display(),
                envelope.id
            )));
        }
        envelope.verify_integrity()?;
        Ok(envelope)
    }

    fn exists(&self, id: ProcessId) -> bool {
        self.path_for(id).exists()
    }

    fn list(&self) -> Result<Vec<ProcessEnvelope>> {
        self.stored_ids()?
            .into_iter()
            .filter(|id| self.exists(*id))
            .map(|id| self.load(id))
            .collect()
    }
}
