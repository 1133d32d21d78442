/*!
Byte encodings for envelope files.

Stores gzip envelopes unless `compress` is off; plain files stay readable with
any JSON tool.
*/

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

use crate::{AipError, Result};

pub trait CompressionAdapter: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Suffix appended to stored file names, including the dot
    fn file_extension(&self) -> &str;
}

/// Gzip at the default level
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCompressor;

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(data)
            .map_err(|e| AipError::compression(format!("Couldn't gzip envelope: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| AipError::compression(format!("Couldn't gzip envelope: {}", e)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut envelope = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut envelope)
            .map_err(|e| AipError::compression(format!("Couldn't gunzip envelope: {}", e)))?;
        Ok(envelope)
    }

    fn file_extension(&self) -> &str {
        ".gz"
    }
}

/// Plain JSON files
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl CompressionAdapter for NoCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn file_extension(&self) -> &str {
        ""
    }
}

/// Adapter for the `compress` engine option
pub fn envelope_compressor(compress: bool) -> Box<dyn CompressionAdapter> {
    if compress {
        Box::new(GzipCompressor)
    } else {
        Box::new(NoCompression)
    }
}
