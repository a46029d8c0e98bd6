use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::{IngestErrorCode, UploadFailure};

pub type SourceReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
    Zip,
    Zstd,
}

impl CompressionType {
    /// Guesses the compression of a file from its extension.
    pub fn from_file_name(name: &str) -> Self {
        let extension = Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);

        match extension.as_deref() {
            Some("gz") => CompressionType::Gzip,
            Some("zip") => CompressionType::Zip,
            Some("zst") => CompressionType::Zstd,
            _ => CompressionType::None,
        }
    }

    pub fn is_compressed(&self) -> bool {
        *self != CompressionType::None
    }

    pub fn extension(&self) -> Option<&'static str> {
        match self {
            CompressionType::None => None,
            CompressionType::Gzip => Some("gz"),
            CompressionType::Zip => Some("zip"),
            CompressionType::Zstd => Some("zst"),
        }
    }
}

/// Where the bytes of an upload come from.
pub enum SourceData {
    File(PathBuf),
    Stream(Option<SourceReader>),
    Buffer(Bytes),
}

/// Caller data to be staged. Consumed by the uploader.
pub struct UploadSource {
    name: String,
    data: SourceData,
    declared_size: Option<u64>,
    compression: CompressionType,
}

impl UploadSource {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let compression = CompressionType::from_file_name(&name);

        Self {
            name,
            data: SourceData::File(path),
            declared_size: None,
            compression,
        }
    }

    pub fn from_stream(
        name: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
        declared_size: Option<u64>,
    ) -> Self {
        Self {
            name: name.into(),
            data: SourceData::Stream(Some(Box::new(reader))),
            declared_size,
            compression: CompressionType::None,
        }
    }

    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            name: name.into(),
            declared_size: Some(bytes.len() as u64),
            data: SourceData::Buffer(bytes),
            compression: CompressionType::None,
        }
    }

    /// A stream source with nothing behind it.
    pub fn empty_stream(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: SourceData::Stream(None),
            declared_size: None,
            compression: CompressionType::None,
        }
    }

    /// Declares the data as already compressed.
    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declared_size(&self) -> Option<u64> {
        self.declared_size
    }

    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    /// Validates the source and reads it into memory.
    ///
    /// Every failure here is a caller input problem and is reported as permanent.
    pub async fn load(self, max_bytes: u64) -> Result<LoadedSource, UploadFailure> {
        let name = self.name;
        let fail = |code: IngestErrorCode, message: String| UploadFailure::new(name.clone(), code, message);
        let too_large = |size: u64| {
            fail(
                IngestErrorCode::SourceSizeLimitExceeded,
                format!("source is {size} bytes, limit is {max_bytes} bytes"),
            )
        };

        if let Some(size) = self.declared_size {
            if size > max_bytes {
                return Err(too_large(size));
            }
        }

        let bytes = match self.data {
            SourceData::File(path) => {
                if path.as_os_str().is_empty() {
                    return Err(fail(IngestErrorCode::SourceIsNull, "no file path given".to_string()));
                }
                let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
                    let code = match e.kind() {
                        ErrorKind::NotFound => IngestErrorCode::SourceNotFound,
                        _ => IngestErrorCode::SourceNotReadable,
                    };
                    fail(code, format!("cannot stat {}", path.display())).with_cause(e)
                })?;
                if !metadata.is_file() {
                    return Err(fail(
                        IngestErrorCode::SourceNotReadable,
                        format!("{} is not a regular file", path.display()),
                    ));
                }
                if metadata.len() == 0 {
                    return Err(fail(IngestErrorCode::SourceIsEmpty, format!("{} is empty", path.display())));
                }
                if metadata.len() > max_bytes {
                    return Err(too_large(metadata.len()));
                }
                let content = tokio::fs::read(&path).await.map_err(|e| {
                    fail(IngestErrorCode::SourceNotReadable, format!("cannot read {}", path.display()))
                        .with_cause(e)
                })?;
                Bytes::from(content)
            }
            SourceData::Stream(None) => {
                return Err(fail(IngestErrorCode::SourceIsNull, "stream is missing".to_string()));
            }
            SourceData::Stream(Some(reader)) => {
                let mut content = Vec::new();
                // One byte past the limit is enough to detect an oversize stream.
                reader
                    .take(max_bytes.saturating_add(1))
                    .read_to_end(&mut content)
                    .await
                    .map_err(|e| {
                        fail(IngestErrorCode::SourceNotReadable, "failed reading stream".to_string())
                            .with_cause(e)
                    })?;
                Bytes::from(content)
            }
            SourceData::Buffer(bytes) => bytes,
        };

        if bytes.is_empty() {
            return Err(fail(IngestErrorCode::SourceIsEmpty, "source has no data".to_string()));
        }
        if bytes.len() as u64 > max_bytes {
            return Err(too_large(bytes.len() as u64));
        }

        Ok(LoadedSource {
            name,
            bytes,
            compression: self.compression,
        })
    }
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = match &self.data {
            SourceData::File(path) => format!("File({})", path.display()),
            SourceData::Stream(Some(_)) => "Stream".to_string(),
            SourceData::Stream(None) => "Stream(missing)".to_string(),
            SourceData::Buffer(bytes) => format!("Buffer({} bytes)", bytes.len()),
        };
        f.debug_struct("UploadSource")
            .field("name", &self.name)
            .field("data", &data)
            .field("declared_size", &self.declared_size)
            .field("compression", &self.compression)
            .finish()
    }
}

/// A validated source held in memory, ready to stage.
#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub name: String,
    pub bytes: Bytes,
    pub compression: CompressionType,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const LIMIT: u64 = 1024;

    async fn load_err(source: UploadSource) -> UploadFailure {
        source.load(LIMIT).await.unwrap_err()
    }

    #[test]
    fn test_compression_from_file_name() {
        assert_eq!(CompressionType::from_file_name("a.csv.gz"), CompressionType::Gzip);
        assert_eq!(CompressionType::from_file_name("a.ZIP"), CompressionType::Zip);
        assert_eq!(CompressionType::from_file_name("a.json.zst"), CompressionType::Zstd);
        assert_eq!(CompressionType::from_file_name("a.csv"), CompressionType::None);
        assert_eq!(CompressionType::from_file_name("noext"), CompressionType::None);
    }

    #[tokio::test]
    async fn test_load_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "a,b,c\n1,2,3\n").unwrap();

        let loaded = UploadSource::from_file(file.path()).load(LIMIT).await.unwrap();
        assert_eq!(loaded.bytes.as_ref(), b"a,b,c\n1,2,3\n");
        assert_eq!(loaded.compression, CompressionType::None);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let failure = load_err(UploadSource::from_file("/definitely/not/here.csv")).await;
        assert_eq!(failure.error_code, IngestErrorCode::SourceNotFound);
        assert!(failure.is_permanent);
    }

    #[tokio::test]
    async fn test_empty_path_is_null() {
        let failure = load_err(UploadSource::from_file("")).await;
        assert_eq!(failure.error_code, IngestErrorCode::SourceIsNull);
        assert!(failure.is_permanent);
    }

    #[tokio::test]
    async fn test_directory_is_not_readable() {
        let dir = tempfile::tempdir().unwrap();
        let failure = load_err(UploadSource::from_file(dir.path())).await;
        assert_eq!(failure.error_code, IngestErrorCode::SourceNotReadable);
    }

    #[tokio::test]
    async fn test_empty_file_is_empty() {
        let file = NamedTempFile::new().unwrap();
        let failure = load_err(UploadSource::from_file(file.path())).await;
        assert_eq!(failure.error_code, IngestErrorCode::SourceIsEmpty);
        assert!(failure.is_permanent);
    }

    #[tokio::test]
    async fn test_oversize_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![b'x'; (LIMIT + 1) as usize]).unwrap();
        let failure = load_err(UploadSource::from_file(file.path())).await;
        assert_eq!(failure.error_code, IngestErrorCode::SourceSizeLimitExceeded);
    }

    #[tokio::test]
    async fn test_missing_stream_is_null() {
        let failure = load_err(UploadSource::empty_stream("events")).await;
        assert_eq!(failure.error_code, IngestErrorCode::SourceIsNull);
    }

    #[tokio::test]
    async fn test_stream_sources() {
        let loaded = UploadSource::from_stream("events", &b"{\"a\":1}"[..], None)
            .load(LIMIT)
            .await
            .unwrap();
        assert_eq!(loaded.bytes.len(), 7);

        let failure = load_err(UploadSource::from_stream("empty", &b""[..], None)).await;
        assert_eq!(failure.error_code, IngestErrorCode::SourceIsEmpty);

        let big = vec![b'y'; (LIMIT * 2) as usize];
        let failure = load_err(UploadSource::from_stream("big", std::io::Cursor::new(big), None)).await;
        assert_eq!(failure.error_code, IngestErrorCode::SourceSizeLimitExceeded);
    }

    #[tokio::test]
    async fn test_declared_size_checked_before_reading() {
        let failure = load_err(UploadSource::from_stream(
            "declared",
            &b"tiny"[..],
            Some(LIMIT * 10),
        ))
        .await;
        assert_eq!(failure.error_code, IngestErrorCode::SourceSizeLimitExceeded);
    }

    #[tokio::test]
    async fn test_buffer_sources() {
        let failure = load_err(UploadSource::from_bytes("zero", Vec::new())).await;
        assert_eq!(failure.error_code, IngestErrorCode::SourceIsEmpty);

        let loaded = UploadSource::from_bytes("data.json.gz", vec![1u8, 2, 3])
            .with_compression(CompressionType::Gzip)
            .load(LIMIT)
            .await
            .unwrap();
        assert_eq!(loaded.compression, CompressionType::Gzip);
        assert_eq!(loaded.name, "data.json.gz");
    }
}
