//! Artifact files: naming, compression, content checks and atomic placement.
//!
//! Artifacts are only ever visible under their final name once fully
//! written and flushed; all intermediate output goes to `*.tmp` paths.

use crate::config::CompressionCodec;
use crate::metadata::BackupType;
use crate::utils::errors::{BackupError, Result};
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use async_compression::tokio::write::{GzipEncoder, ZstdEncoder};
use async_compression::Level;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use uuid::Uuid;

/// Keywords the head of a plain SQL dump is expected to contain.
const SQL_MARKERS: &[&str] = &["CREATE", "INSERT", "SET", "COPY"];

/// Bytes inspected by [`check_sql_content`].
const SNIFF_BYTES: usize = 1024;

const TEMP_SUFFIX: &str = ".tmp";

/// Backup file names: `[A-Za-z0-9_.-]+` ending in `.sql`, `.sql.gz` or `.sql.zst`.
pub fn is_artifact_name(name: &str) -> bool {
    let charset_ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !charset_ok || name.contains("..") {
        return false;
    }
    [".sql", ".sql.gz", ".sql.zst"]
        .iter()
        .any(|suffix| name.len() > suffix.len() && name.ends_with(suffix))
}

pub fn validate_filename(name: &str) -> Result<()> {
    if is_artifact_name(name) {
        Ok(())
    } else {
        Err(BackupError::InvalidFilename(name.to_string()))
    }
}

/// Compression codec implied by the file name, `None` for plain `.sql`.
/// Staged `*.tmp` files carry the codec of the name they will be renamed to.
pub fn codec_of(name: &str) -> Option<CompressionCodec> {
    let name = name.strip_suffix(TEMP_SUFFIX).unwrap_or(name);
    if name.ends_with(".sql.gz") {
        Some(CompressionCodec::Gzip)
    } else if name.ends_with(".sql.zst") {
        Some(CompressionCodec::Zstd)
    } else {
        None
    }
}

/// `{type}_backup_{YYYYMMDD_HHMMSS}_{8 hex}.sql[.gz|.zst]`
///
/// The random suffix keeps names unique when two backups start in the same second.
pub fn generate_filename(
    backup_type: BackupType,
    at: DateTime<Utc>,
    codec: Option<CompressionCodec>,
) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    let mut name = format!(
        "{}_backup_{}_{}.sql",
        backup_type.as_str(),
        at.format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    );
    if let Some(codec) = codec {
        name.push('.');
        name.push_str(codec.extension());
    }
    name
}

pub fn temp_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TEMP_SUFFIX);
    final_path.with_file_name(name)
}

/// Temporary files removed when the guard drops, whatever the outcome.
#[derive(Debug, Default)]
pub struct TempFiles(Vec<PathBuf>);

impl TempFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, path: PathBuf) -> PathBuf {
        self.0.push(path.clone());
        path
    }
}

impl Drop for TempFiles {
    fn drop(&mut self) {
        for path in &self.0 {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Stream `src` through the codec into `dst` and flush it to disk.
pub async fn compress(src: &Path, dst: &Path, codec: CompressionCodec, level: i32) -> Result<()> {
    let mut input = File::open(src)
        .await
        .map_err(|e| BackupError::from_io(e, src.display()))?;
    let output = File::create(dst).await?;
    let quality = Level::Precise(level);

    let output = match codec {
        CompressionCodec::Gzip => {
            pump(&mut input, GzipEncoder::with_quality(output, quality))
                .await?
                .into_inner()
        }
        CompressionCodec::Zstd => {
            pump(&mut input, ZstdEncoder::with_quality(output, quality))
                .await?
                .into_inner()
        }
    };
    output.sync_all().await?;
    Ok(())
}

async fn pump<E>(input: &mut File, mut encoder: E) -> std::io::Result<E>
where
    E: AsyncWrite + Unpin,
{
    tokio::io::copy(input, &mut encoder).await?;
    encoder.shutdown().await?;
    Ok(encoder)
}

/// Reader over the plain SQL content of an artifact, decoding by file name.
pub async fn open_decoded(path: &Path) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
    let file = File::open(path)
        .await
        .map_err(|e| BackupError::from_io(e, path.display()))?;
    let reader = BufReader::new(file);
    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();

    Ok(match codec_of(&name) {
        None => Box::new(reader),
        Some(CompressionCodec::Gzip) => Box::new(GzipDecoder::new(reader)),
        Some(CompressionCodec::Zstd) => Box::new(ZstdDecoder::new(reader)),
    })
}

/// Write the decoded content of `src` to `dst`. Returns the plain size.
pub async fn decompress_to(src: &Path, dst: &Path) -> Result<u64> {
    let mut reader = open_decoded(src).await?;
    let mut output = File::create(dst).await?;
    let written = tokio::io::copy(&mut reader, &mut output)
        .await
        .map_err(|e| decode_error(src, e))?;
    output.sync_all().await?;
    Ok(written)
}

/// The artifact must be non-empty and its head must look like SQL.
pub async fn check_sql_content(path: &Path) -> Result<()> {
    let mut reader = open_decoded(path).await?;
    let mut head = vec![0u8; SNIFF_BYTES];
    let mut filled = 0;

    while filled < SNIFF_BYTES {
        let n = reader
            .read(&mut head[filled..])
            .await
            .map_err(|e| decode_error(path, e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled == 0 {
        return Err(BackupError::ValidationFailed(format!(
            "{} is empty",
            path.display()
        )));
    }

    let text = String::from_utf8_lossy(&head[..filled]);
    if SQL_MARKERS.iter().any(|marker| text.contains(marker)) {
        Ok(())
    } else {
        Err(BackupError::ValidationFailed(format!(
            "{} does not appear to contain SQL",
            path.display()
        )))
    }
}

fn decode_error(path: &Path, err: std::io::Error) -> BackupError {
    match err.kind() {
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
            BackupError::ValidationFailed(format!("cannot decode {}: {}", path.display(), err))
        }
        _ => BackupError::Io(err),
    }
}

pub async fn sync_file(path: &Path) -> Result<()> {
    File::open(path).await?.sync_all().await?;
    Ok(())
}

/// Rename `tmp` onto `final_path` and persist the directory entry.
pub async fn finalize(tmp: &Path, final_path: &Path) -> Result<()> {
    tokio::fs::rename(tmp, final_path).await?;

    #[cfg(unix)]
    if let Some(parent) = final_path.parent() {
        let parent = parent.to_path_buf();
        tokio::task::spawn_blocking(move || std::fs::File::open(&parent)?.sync_all())
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;
    }

    Ok(())
}
