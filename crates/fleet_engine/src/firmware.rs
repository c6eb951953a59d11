//! Firmware images, identified by the SHA-256 of their bytes.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Firmware image is empty")]
    Empty,
    #[error("Firmware version {version} is not a SHA-256 hex digest")]
    InvalidVersion { version: String },
    #[error("Unknown firmware version {version}")]
    NotFound { version: String },
    #[error("Firmware store I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Version identifier of an image.
pub fn firmware_version(image: &[u8]) -> String {
    hex::encode(Sha256::digest(image))
}

fn validate_version(version: &str) -> Result<(), FirmwareError> {
    if version.len() == 64 && version.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(FirmwareError::InvalidVersion {
            version: version.to_string(),
        })
    }
}

#[async_trait]
pub trait FirmwareStore: Send + Sync {
    /// Store an image and return its version.
    async fn put(&self, image: Vec<u8>) -> Result<String, FirmwareError>;

    async fn get(&self, version: &str) -> Result<Vec<u8>, FirmwareError>;
}

/// One `<version>.bin` file per image.
#[derive(Debug, Clone)]
pub struct DirectoryFirmwareStore {
    dir: PathBuf,
}

impl DirectoryFirmwareStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DirectoryFirmwareStore { dir: dir.into() }
    }

    fn path_of(&self, version: &str) -> PathBuf {
        self.dir.join(format!("{version}.bin"))
    }
}

#[async_trait]
impl FirmwareStore for DirectoryFirmwareStore {
    async fn put(&self, image: Vec<u8>) -> Result<String, FirmwareError> {
        if image.is_empty() {
            return Err(FirmwareError::Empty);
        }
        let version = firmware_version(&image);
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_of(&version);
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &image).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        info!("Stored firmware {} ({} bytes)", version, image.len());
        Ok(version)
    }

    async fn get(&self, version: &str) -> Result<Vec<u8>, FirmwareError> {
        validate_version(version)?;
        match tokio::fs::read(self.path_of(version)).await {
            Ok(image) => Ok(image),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FirmwareError::NotFound {
                version: version.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryFirmwareStore {
    images: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryFirmwareStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FirmwareStore for MemoryFirmwareStore {
    async fn put(&self, image: Vec<u8>) -> Result<String, FirmwareError> {
        if image.is_empty() {
            return Err(FirmwareError::Empty);
        }
        let version = firmware_version(&image);
        self.images.lock().insert(version.clone(), image);
        Ok(version)
    }

    async fn get(&self, version: &str) -> Result<Vec<u8>, FirmwareError> {
        validate_version(version)?;
        self.images
            .lock()
            .get(version)
            .cloned()
            .ok_or_else(|| FirmwareError::NotFound {
                version: version.to_string(),
            })
    }
}
