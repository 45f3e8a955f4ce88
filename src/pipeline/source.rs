// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 帧来源: 单张图片或图片目录

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, Receiver};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use super::Frame;

const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "bmp", "tif", "tiff", "webp"];

/// 待处理图片列表
#[derive(Debug, Clone)]
pub struct FrameSource {
    paths: Vec<PathBuf>,
}

impl FrameSource {
    /// 单张图片, 或目录下按文件名排序的所有图片
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.is_file() {
            return Ok(Self {
                paths: vec![path.to_path_buf()],
            });
        }
        if !path.is_dir() {
            bail!("输入不存在: {}", path.display());
        }

        let mut paths = Vec::new();
        for entry in
            std::fs::read_dir(path).with_context(|| format!("无法读取目录 {}", path.display()))?
        {
            let p = entry?.path();
            if p.is_file() && is_image(&p) {
                paths.push(p);
            }
        }
        paths.sort();
        if paths.is_empty() {
            log::warn!("⚠️  目录 {} 中没有图片", path.display());
        }
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// 在独立线程中解码图片, 通过有界通道送出; 读取失败的文件记录日志后跳过
pub fn spawn_loader(source: FrameSource, capacity: usize) -> (Receiver<Frame>, JoinHandle<()>) {
    let (tx, rx) = bounded(capacity.max(1));
    let handle = thread::spawn(move || {
        log::debug!("📂 Loader 启动, {} 张图片", source.len());
        let mut frame_id = 0u64;
        for path in source.paths {
            let image = match image::open(&path) {
                Ok(img) => img,
                Err(e) => {
                    log::error!("❌ 读取图片失败 {}: {}", path.display(), e);
                    continue;
                }
            };
            let frame = Frame {
                image,
                path,
                frame_id,
            };
            frame_id += 1;
            if tx.send(frame).is_err() {
                // 接收端已退出
                break;
            }
        }
        log::debug!("📂 Loader 结束, 共 {} 帧", frame_id);
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("birdview_source_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_directory_sorted_and_filtered() {
        let dir = temp_dir("sorted");
        for name in ["b.png", "a.JPG", "c.txt"] {
            std::fs::write(dir.join(name), b"x").unwrap();
        }
        let src = FrameSource::from_path(&dir).unwrap();
        let names: Vec<_> = src
            .paths()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.JPG", "b.png"]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_source() {
        assert!(FrameSource::from_path("/nonexistent/birdview/input").is_err());
    }

    #[test]
    fn test_loader_skips_unreadable() {
        let dir = temp_dir("loader");
        RgbImage::from_pixel(8, 4, Rgb([1, 2, 3]))
            .save(dir.join("a.png"))
            .unwrap();
        std::fs::write(dir.join("b.png"), b"not an image").unwrap();
        RgbImage::from_pixel(2, 2, Rgb([0, 0, 0]))
            .save(dir.join("c.png"))
            .unwrap();

        let (rx, handle) = spawn_loader(FrameSource::from_path(&dir).unwrap(), 1);
        let frames: Vec<Frame> = rx.iter().collect();
        handle.join().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].stem(), "a");
        assert_eq!(frames[0].image.width(), 8);
        assert_eq!(frames[1].stem(), "c");
        assert_eq!(frames[1].frame_id, 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
