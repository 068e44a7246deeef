use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use super::{FrameSource, Pacer, SourceStats};
use crate::frame::Frame;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Replays the still images of one directory in file-name order, once.
///
/// After the last image the source keeps answering "no frame". An image that fails to
/// decode is reported as an error for that read only.
pub struct DirSource {
    root: PathBuf,
    pending: VecDeque<PathBuf>,
    pacer: Pacer,
    frame_count: u64,
}

impl DirSource {
    pub fn open(path: impl AsRef<Path>, target_fps: u32) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&root)
            .with_context(|| format!("read frame directory {}", root.display()))?
        {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_image && path.is_file() {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(anyhow!("no images in frame directory {}", root.display()));
        }
        files.sort();
        log::info!("DirSource: {} images in {}", files.len(), root.display());

        Ok(Self {
            root,
            pending: files.into(),
            pacer: Pacer::new(target_fps),
            frame_count: 0,
        })
    }
}

impl FrameSource for DirSource {
    fn describe(&self) -> String {
        format!("image directory {}", self.root.display())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };
        self.pacer.wait();
        let image = image::open(&path)
            .with_context(|| format!("decode frame {}", path.display()))?
            .to_rgb8();
        self.frame_count += 1;
        Frame::from_image(image, self.frame_count).map(Some)
    }

    fn is_healthy(&self) -> bool {
        !self.pending.is_empty()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: format!("dir://{}", self.root.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn replays_images_in_name_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        RgbImage::from_pixel(8, 6, image::Rgb([1, 2, 3])).save(dir.path().join("b.png"))?;
        RgbImage::from_pixel(4, 2, image::Rgb([1, 2, 3])).save(dir.path().join("a.png"))?;
        std::fs::write(dir.path().join("notes.txt"), "skip me")?;

        let mut src = DirSource::open(dir.path(), 0)?;
        let first = src.next_frame()?.ok_or_else(|| anyhow!("no frame"))?;
        let second = src.next_frame()?.ok_or_else(|| anyhow!("no frame"))?;
        assert_eq!((first.width, first.index), (4, 1));
        assert_eq!((second.width, second.index), (8, 2));
        assert!(src.next_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn empty_directory_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(DirSource::open(dir.path(), 0).is_err());
        Ok(())
    }
}
