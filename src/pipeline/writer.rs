// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 结果落盘: 分割图、可行驶区域、鸟瞰图与检测结果 JSON

use ab_glyph::FontVec;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use super::Frame;
use crate::perception::PerceptionOutput;
use crate::render::{colorize_birdview, draw_detections};
use crate::{Bbox, PerceptionConfig};

/// 单个检测结果 (JSON)
#[derive(Debug, Clone, Serialize)]
pub struct DetectionRecord {
    pub class_id: usize,
    pub name: String,
    pub confidence: f32,
    pub bbox: [f32; 4], // xyxy, 帧坐标
    pub ground_point: [f32; 2],
}

impl DetectionRecord {
    pub fn from_bbox(bbox: &Bbox, names: &[String]) -> Self {
        let ground = bbox.ground_point();
        Self {
            class_id: bbox.id(),
            name: names
                .get(bbox.id())
                .cloned()
                .unwrap_or_else(|| bbox.id().to_string()),
            confidence: bbox.confidence(),
            bbox: [bbox.xmin(), bbox.ymin(), bbox.xmax(), bbox.ymax()],
            ground_point: [ground.x(), ground.y()],
        }
    }
}

/// 单帧报告 (JSON)
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    pub frame_id: u64,
    pub source: PathBuf,
    pub width: u32,
    pub height: u32,
    pub detections: Vec<DetectionRecord>,
    pub segmentation_ms: f64,
    pub warp_ms: f64,
    pub detection_ms: f64,
    pub rasterize_ms: f64,
}

pub struct OutputWriter {
    dir: PathBuf,
    config: PerceptionConfig,
    font: Option<FontVec>,
}

impl OutputWriter {
    pub fn new<P: AsRef<Path>>(dir: P, config: PerceptionConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("无法创建输出目录 {}", dir.display()))?;
        Ok(Self {
            dir,
            config,
            font: None,
        })
    }

    /// 检测叠加图的标签字体
    pub fn with_font(mut self, font: Option<FontVec>) -> Self {
        self.font = font;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, stem: &str, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}_{}", stem, suffix))
    }

    /// 写出一帧的全部结果, 返回写入的文件
    pub fn write(
        &self,
        frame: &Frame,
        output: &PerceptionOutput,
        overlay: bool,
    ) -> Result<Vec<PathBuf>> {
        let stem = frame.stem();
        let mut written = Vec::with_capacity(6);

        let p = self.path(&stem, "segmented.png");
        output.segmented.save(&p)?;
        written.push(p);

        let p = self.path(&stem, "drivable.png");
        output.drivable.save(&p)?;
        written.push(p);

        let p = self.path(&stem, "birdview.png");
        output.drivable_birdview.save(&p)?;
        written.push(p);

        let p = self.path(&stem, "birdview_objects.png");
        colorize_birdview(&output.birdview_with_objects, &self.config).save(&p)?;
        written.push(p);

        if overlay {
            let mut canvas = frame.image.to_rgb8();
            draw_detections(
                &mut canvas,
                &output.detections,
                &self.config.detector.names,
                self.font.as_ref(),
            );
            let p = self.path(&stem, "detections.png");
            canvas.save(&p)?;
            written.push(p);
        }

        let report = FrameReport {
            frame_id: frame.frame_id,
            source: frame.path.clone(),
            width: frame.image.width(),
            height: frame.image.height(),
            detections: output
                .detections
                .iter()
                .map(|b| DetectionRecord::from_bbox(b, &self.config.detector.names))
                .collect(),
            segmentation_ms: output.timings.segmentation.as_secs_f64() * 1000.0,
            warp_ms: output.timings.warp.as_secs_f64() * 1000.0,
            detection_ms: output.timings.detection.as_secs_f64() * 1000.0,
            rasterize_ms: output.timings.rasterize.as_secs_f64() * 1000.0,
        };
        let p = self.path(&stem, "detections.json");
        fs::write(&p, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("写入失败 {}", p.display()))?;
        written.push(p);

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::StageTimings;
    use image::{DynamicImage, GrayImage, RgbImage};

    fn output() -> PerceptionOutput {
        PerceptionOutput {
            drivable: GrayImage::new(8, 6),
            drivable_birdview: GrayImage::new(5, 5),
            detections: vec![Bbox::from_xyxy(1.0, 1.0, 3.0, 5.0, 0, 0.8)],
            birdview_with_objects: GrayImage::new(5, 5),
            segmented: RgbImage::new(8, 6),
            timings: StageTimings::default(),
        }
    }

    #[test]
    fn test_write_all_outputs() {
        let dir = std::env::temp_dir().join(format!("birdview_writer_{}", std::process::id()));
        let writer = OutputWriter::new(&dir, PerceptionConfig::default()).unwrap();
        let frame = Frame {
            image: DynamicImage::ImageRgb8(RgbImage::new(8, 6)),
            path: PathBuf::from("input/cam_0001.jpg"),
            frame_id: 3,
        };

        let files = writer.write(&frame, &output(), true).unwrap();
        assert_eq!(files.len(), 6);
        assert!(files.iter().all(|p| p.exists()));
        assert!(dir.join("cam_0001_birdview_objects.png").exists());

        let json = fs::read_to_string(dir.join("cam_0001_detections.json")).unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["frame_id"], 3);
        assert_eq!(v["detections"][0]["name"], "person");
        assert_eq!(v["detections"][0]["ground_point"][0], 2.0);

        let files = writer.write(&frame, &output(), false).unwrap();
        assert_eq!(files.len(), 5);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_failed_write_leaves_writer_usable() {
        let dir = std::env::temp_dir().join(format!("birdview_writer_err_{}", std::process::id()));
        let writer = OutputWriter::new(&dir, PerceptionConfig::default()).unwrap();
        let frame = Frame {
            image: DynamicImage::ImageRgb8(RgbImage::new(8, 6)),
            path: PathBuf::from("cam_0002.jpg"),
            frame_id: 4,
        };

        fs::remove_dir_all(&dir).unwrap();
        assert!(writer.write(&frame, &output(), false).is_err());

        // 目录恢复后下一帧正常写出
        fs::create_dir_all(&dir).unwrap();
        let files = writer.write(&frame, &output(), false).unwrap();
        assert_eq!(files.len(), 5);
        fs::remove_dir_all(&dir).unwrap();
    }
}
