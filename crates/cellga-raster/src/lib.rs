//! PNG snapshot adapter persisting population frames to disk.
//!
//! The engine hands over `(width, height, row-major RGB triples)`; this crate
//! owns the raster encoding and the on-disk naming scheme.

use cellga_core::{SnapshotFrame, SnapshotSink};
use image::RgbImage;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while persisting snapshot frames.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("cannot prepare snapshot directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("frame of {width}x{height} pixels does not match {len} bytes")]
    MalformedFrame { width: u32, height: u32, len: usize },
    #[error("failed to encode snapshot image: {0}")]
    Encode(#[from] image::ImageError),
}

/// Sink writing one `generation_<n>.png` per frame into a fixed directory.
#[derive(Debug, Clone)]
pub struct PngSnapshotSink {
    directory: PathBuf,
}

impl PngSnapshotSink {
    /// Create the sink, making sure the target directory exists.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, RasterError> {
        let directory = directory.into();
        fs::create_dir_all(&directory).map_err(|source| RasterError::Directory {
            path: directory.clone(),
            source,
        })?;
        Ok(Self { directory })
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path the given generation's frame is written to.
    #[must_use]
    pub fn frame_path(&self, generation: u32) -> PathBuf {
        self.directory.join(format!("generation_{generation}.png"))
    }

    fn write_frame(&self, frame: &SnapshotFrame<'_>) -> Result<PathBuf, RasterError> {
        let expected = frame.width as usize * frame.height as usize * 3;
        if frame.pixels.len() != expected {
            return Err(RasterError::MalformedFrame {
                width: frame.width,
                height: frame.height,
                len: frame.pixels.len(),
            });
        }
        let image = RgbImage::from_raw(frame.width, frame.height, frame.pixels.to_vec()).ok_or(
            RasterError::MalformedFrame {
                width: frame.width,
                height: frame.height,
                len: frame.pixels.len(),
            },
        )?;
        let path = self.frame_path(frame.generation.0);
        image.save(&path)?;
        Ok(path)
    }
}

impl SnapshotSink for PngSnapshotSink {
    fn on_snapshot(
        &mut self,
        frame: &SnapshotFrame<'_>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.write_frame(frame)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellga_core::Generation;
    use tempfile::tempdir;

    #[test]
    fn writes_a_decodable_png_per_generation() {
        let dir = tempdir().expect("tempdir");
        let mut sink = PngSnapshotSink::new(dir.path()).expect("sink");

        let pixels: Vec<u8> = vec![
            255, 0, 0, /* */ 0, 255, 0, //
            0, 0, 255, /* */ 9, 9, 9, //
        ];
        let frame = SnapshotFrame {
            generation: Generation(7),
            width: 2,
            height: 2,
            pixels: &pixels,
        };
        sink.on_snapshot(&frame).expect("snapshot");

        let path = sink.frame_path(7);
        assert!(path.exists());
        let decoded = image::open(&path).expect("decode").into_rgb8();
        assert_eq!(decoded.dimensions(), (2, 2));
        assert_eq!(decoded.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(decoded.get_pixel(1, 1).0, [9, 9, 9]);
    }

    #[test]
    fn rejects_frames_with_mismatched_byte_counts() {
        let dir = tempdir().expect("tempdir");
        let sink = PngSnapshotSink::new(dir.path()).expect("sink");
        let pixels = vec![0_u8; 5];
        let frame = SnapshotFrame {
            generation: Generation(1),
            width: 2,
            height: 2,
            pixels: &pixels,
        };
        assert!(matches!(
            sink.write_frame(&frame),
            Err(RasterError::MalformedFrame { .. })
        ));
    }
}
