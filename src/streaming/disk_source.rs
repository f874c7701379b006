//! Directory-backed tile source.
//!
//! Tiles live under `{root}/{level}/{x}_{y}.rgba` as raw padded RGBA8, or
//! as `{x}_{y}.rgba.zst` compressed with zstd. Reads go through tokio's
//! async file I/O; decompression runs on the blocking pool.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::debug;

use crate::streaming::source::{FetchError, TileImage, TileSource};
use crate::tile::address::TileAddress;

/// Reads pre-cut tiles from a directory tree.
#[derive(Debug, Clone)]
pub struct DirectoryTileSource {
    root: PathBuf,
    edge: u32,
}

impl DirectoryTileSource {
    /// `edge` is the padded tile size every file must match.
    pub fn new(root: impl Into<PathBuf>, edge: u32) -> Self {
        Self {
            root: root.into(),
            edge,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the uncompressed file for a tile.
    pub fn tile_path(&self, address: TileAddress) -> PathBuf {
        self.root
            .join(address.level().to_string())
            .join(format!("{}_{}.rgba", address.x(), address.y()))
    }

    fn compressed_path(&self, address: TileAddress) -> PathBuf {
        let mut path = self.tile_path(address).into_os_string();
        path.push(".zst");
        PathBuf::from(path)
    }

    /// Write a tile in the layout this source reads, optionally compressed.
    pub async fn store(&self, address: TileAddress, pixels: &[u8], compress: bool) -> Result<(), FetchError> {
        let path = if compress {
            self.compressed_path(address)
        } else {
            self.tile_path(address)
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let data = if compress {
            zstd::encode_all(pixels, 3)?
        } else {
            pixels.to_vec()
        };
        fs::write(&path, data).await?;
        Ok(())
    }

    async fn read_raw(&self, address: TileAddress) -> Result<Vec<u8>, FetchError> {
        let plain = self.tile_path(address);
        if fs::try_exists(&plain).await? {
            return Ok(fs::read(&plain).await?);
        }

        let packed = self.compressed_path(address);
        if !fs::try_exists(&packed).await? {
            return Err(FetchError::NotFound(address));
        }
        let data = fs::read(&packed).await?;
        tokio::task::spawn_blocking(move || zstd::decode_all(data.as_slice()))
            .await
            .map_err(|e| FetchError::Decode {
                address,
                reason: e.to_string(),
            })?
            .map_err(|e| FetchError::Decode {
                address,
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl TileSource for DirectoryTileSource {
    async fn fetch(&self, address: TileAddress) -> Result<TileImage, FetchError> {
        let pixels = self.read_raw(address).await?;
        let expected = TileImage::byte_len(self.edge);
        if pixels.len() != expected {
            return Err(FetchError::Decode {
                address,
                reason: format!("{} bytes, expected {expected}", pixels.len()),
            });
        }
        debug!(tile = %address, bytes = pixels.len(), "Read tile from disk");
        Ok(TileImage {
            width: self.edge,
            height: self.edge,
            pixels: Bytes::from(pixels),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_raw_and_compressed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectoryTileSource::new(dir.path(), 2);
        let a = TileAddress::new(1, 0, 1).unwrap();
        let b = TileAddress::new(0, 1, 1).unwrap();
        let pixels: Vec<u8> = (0..16).collect();

        source.store(a, &pixels, false).await.unwrap();
        source.store(b, &pixels, true).await.unwrap();

        assert_eq!(source.fetch(a).await.unwrap().pixels.as_ref(), pixels.as_slice());
        assert_eq!(source.fetch(b).await.unwrap().pixels.as_ref(), pixels.as_slice());
        assert!(source.tile_path(a).ends_with("1/1_0.rgba"));
    }

    #[tokio::test]
    async fn test_missing_tile() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectoryTileSource::new(dir.path(), 2);
        assert!(matches!(
            source.fetch(TileAddress::ROOT).await,
            Err(FetchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_size_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectoryTileSource::new(dir.path(), 4);
        source.store(TileAddress::ROOT, &[0u8; 10], false).await.unwrap();
        assert!(matches!(
            source.fetch(TileAddress::ROOT).await,
            Err(FetchError::Decode { .. })
        ));
    }
}
