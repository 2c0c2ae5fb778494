use std::path::{Path, PathBuf};

use log::debug;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};

/// Sequential, non-seekable byte stream of known length
#[trait_variant::make(Send)]
pub trait ImageSource {
    /// Human readable name
    fn label(&self) -> &str;

    /// Declared length in bytes
    fn total_size(&self) -> u64;

    /// Read into `buf`, 0 means end of stream
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Release the stream. Called once when a run ends, whatever the outcome
    async fn close(&mut self);
}

/// A user-picked image reference, opened into a fresh [`ImageSource`] per run
#[trait_variant::make(Send)]
pub trait ImageLocator: Send + Sync {
    type Source: ImageSource + Send;

    fn label(&self) -> &str;

    fn size(&self) -> u64;

    /// Fails with [`Error::SourceUnavailable`] when the image cannot be opened
    async fn open(&self) -> Result<Self::Source>;
}

/// Image file on the local filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedImage {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
}

impl SelectedImage {
    /// Resolve display name and size of `path`
    pub async fn resolve(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(Error::SourceUnavailable)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self {
            path: path.to_path_buf(),
            name,
            size: metadata.len(),
        })
    }
}

impl ImageLocator for SelectedImage {
    type Source = FileImageSource;

    fn label(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn open(&self) -> Result<FileImageSource> {
        let file = File::open(&self.path)
            .await
            .map_err(Error::SourceUnavailable)?;
        debug!("opened image {}", self.path.display());
        Ok(FileImageSource {
            file: Some(file),
            label: self.name.clone(),
            total_size: self.size,
        })
    }
}

pub struct FileImageSource {
    file: Option<File>,
    label: String,
    total_size: u64,
}

impl ImageSource for FileImageSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn total_size(&self) -> u64 {
        self.total_size
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.read(buf).await.map_err(Error::SourceRead),
            None => Ok(0),
        }
    }

    async fn close(&mut self) {
        self.file = None;
    }
}

/// In-memory image
#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    pub name: String,
    pub data: Vec<u8>,
    /// Upper bound on bytes returned per read, 0 for no bound
    pub read_limit: usize,
}

impl MemoryImage {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
            read_limit: 0,
        }
    }
}

impl ImageLocator for MemoryImage {
    type Source = MemoryImageSource;

    fn label(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn open(&self) -> Result<MemoryImageSource> {
        Ok(MemoryImageSource {
            image: self.clone(),
            position: 0,
            closed: false,
        })
    }
}

pub struct MemoryImageSource {
    image: MemoryImage,
    position: usize,
    closed: bool,
}

impl MemoryImageSource {
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl ImageSource for MemoryImageSource {
    fn label(&self) -> &str {
        &self.image.name
    }

    fn total_size(&self) -> u64 {
        self.image.data.len() as u64
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = &self.image.data[self.position..];
        let mut len = remaining.len().min(buf.len());
        if self.image.read_limit > 0 {
            len = len.min(self.image.read_limit);
        }
        buf[..len].copy_from_slice(&remaining[..len]);
        self.position += len;
        Ok(len)
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
