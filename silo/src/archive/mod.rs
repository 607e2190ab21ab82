//! Archive ingestion helpers: format sniffing and decompression.
//!
//! Tar layers arrive plain, gzip-, or zstd-compressed. Gzip decodes
//! streaming; zstd is decompressed to a temporary file first and the tar
//! reader runs over that. Zip is recognized for bundled asset extraction.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use silo_shared::{SiloError, SiloResult};
use tempfile::NamedTempFile;
use tracing::debug;

/// Compression applied to a tar stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    /// Sniff the magic bytes.
    #[default]
    Auto,
    None,
    Gzip,
    Zstd,
}

/// Container format of an archive file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveFlavor {
    Tar(Compression),
    Zip,
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const ZIP_MAGIC: [u8; 4] = [b'P', b'K', 0x03, 0x04];

/// Identify an archive by its leading bytes. Anything unrecognized is
/// assumed to be a plain tar (v7 tars have no magic at offset zero).
pub fn sniff(path: &Path) -> SiloResult<ArchiveFlavor> {
    let mut file = File::open(path)
        .map_err(|e| SiloError::Io(format!("failed to open {}: {}", path.display(), e)))?;
    let mut magic = [0u8; 4];
    let n = read_at_most(&mut file, &mut magic)
        .map_err(|e| SiloError::Io(format!("failed to read {}: {}", path.display(), e)))?;
    let flavor = if n >= 4 && magic == ZSTD_MAGIC {
        ArchiveFlavor::Tar(Compression::Zstd)
    } else if n >= 4 && magic == ZIP_MAGIC {
        ArchiveFlavor::Zip
    } else if n >= 2 && magic[..2] == GZIP_MAGIC {
        ArchiveFlavor::Tar(Compression::Gzip)
    } else {
        ArchiveFlavor::Tar(Compression::None)
    };
    debug!(path = %path.display(), ?flavor, "sniffed archive");
    Ok(flavor)
}

/// A tar layer opened for (possibly repeated) reading.
///
/// Zstd sources are decompressed once into a temporary file that lives as
/// long as the source; every [`reader`](LayerSource::reader) call then
/// starts a fresh pass, which is what the formatter's two-pass unpack
/// needs.
#[derive(Debug)]
pub struct LayerSource {
    path: PathBuf,
    compression: Compression,
    decompressed: Option<NamedTempFile>,
}

impl LayerSource {
    pub fn open(path: &Path, compression: Compression) -> SiloResult<LayerSource> {
        let compression = match compression {
            Compression::Auto => match sniff(path)? {
                ArchiveFlavor::Tar(c) => c,
                ArchiveFlavor::Zip => {
                    return Err(SiloError::Format(format!(
                        "{} is a zip archive, not a tar layer",
                        path.display()
                    )))
                }
            },
            explicit => explicit,
        };

        let decompressed = match compression {
            Compression::Zstd => {
                let input = File::open(path).map_err(|e| {
                    SiloError::Io(format!("failed to open {}: {}", path.display(), e))
                })?;
                let mut temp = NamedTempFile::new()
                    .map_err(|e| SiloError::Io(format!("failed to create temp file: {}", e)))?;
                zstd::stream::copy_decode(BufReader::new(input), &mut temp).map_err(|e| {
                    SiloError::Format(format!(
                        "failed to decompress zstd layer {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Some(temp)
            }
            _ => None,
        };

        Ok(LayerSource {
            path: path.to_path_buf(),
            compression,
            decompressed,
        })
    }

    /// Open a fresh sequential reader over the decompressed tar stream.
    pub fn reader(&self) -> SiloResult<Box<dyn Read>> {
        match (&self.decompressed, self.compression) {
            (Some(temp), _) => {
                let file = temp.reopen().map_err(|e| {
                    SiloError::Io(format!("failed to reopen decompressed layer: {}", e))
                })?;
                Ok(Box::new(BufReader::new(file)))
            }
            (None, Compression::Gzip) => {
                let file = self.open_source()?;
                Ok(Box::new(GzDecoder::new(BufReader::new(file))))
            }
            (None, _) => {
                let file = self.open_source()?;
                Ok(Box::new(BufReader::new(file)))
            }
        }
    }

    fn open_source(&self) -> SiloResult<File> {
        File::open(&self.path).map_err(|e| {
            SiloError::Io(format!("failed to open {}: {}", self.path.display(), e))
        })
    }
}

fn read_at_most(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
