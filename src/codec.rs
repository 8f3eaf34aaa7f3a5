//! Optional payload compression.

use std::fmt;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Deserialize;

/// Compression applied to message bodies before publishing.
///
/// Unknown names from configuration are kept as [`Compression::Unsupported`]
/// and only fail when a message is actually compressed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Unsupported(String),
}

impl From<String> for Compression {
    fn from(name: String) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "" | "none" => Compression::None,
            "gzip" => Compression::Gzip,
            _ => Compression::Unsupported(name),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => f.write_str("none"),
            Compression::Gzip => f.write_str("gzip"),
            Compression::Unsupported(name) => f.write_str(name),
        }
    }
}

/// Errors raised by [`compress`] and [`decompress`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Compression type '{0}' not supported")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Compress a message body.
pub fn compress(bytes: Vec<u8>, compression: &Compression) -> Result<Vec<u8>, CodecError> {
    match compression {
        Compression::None => Ok(bytes),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&bytes)?;
            Ok(encoder.finish()?)
        }
        Compression::Unsupported(name) => Err(CodecError::Unsupported(name.clone())),
    }
}

/// Reverse [`compress`].
pub fn decompress(bytes: &[u8], compression: &Compression) -> Result<Vec<u8>, CodecError> {
    match compression {
        Compression::None => Ok(bytes.to_vec()),
        Compression::Gzip => {
            let mut decoder = GzDecoder::new(bytes);
            let mut decompressed = Vec::new();
            decoder.read_to_end(&mut decompressed)?;
            Ok(decompressed)
        }
        Compression::Unsupported(name) => Err(CodecError::Unsupported(name.clone())),
    }
}
