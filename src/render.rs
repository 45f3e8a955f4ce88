// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 调试可视化: 检测框叠加 + 鸟瞰图上色

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;

use crate::models::segmentation::class_color;
use crate::{Bbox, PerceptionConfig};

const BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);
const DRIVABLE_FILL: Rgb<u8> = Rgb([64, 64, 64]);
const DRIVABLE_EDGE: Rgb<u8> = Rgb([0, 255, 0]);
const PERSON: Rgb<u8> = Rgb([255, 0, 0]);
const OBSTACLE: Rgb<u8> = Rgb([255, 165, 0]);

/// 加载标签字体 (TTF/OTF)
pub fn load_font<P: AsRef<Path>>(path: P) -> Result<FontVec> {
    let path = path.as_ref();
    let bytes =
        std::fs::read(path).with_context(|| format!("无法读取字体文件 {}", path.display()))?;
    FontVec::try_from_vec(bytes).with_context(|| format!("字体解析失败 {}", path.display()))
}

/// 在帧上画检测框, 有字体时附带 "类别 置信度" 标签
pub fn draw_detections(
    frame: &mut RgbImage,
    dets: &[Bbox],
    names: &[String],
    font: Option<&FontVec>,
) {
    let (w, h) = frame.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let thickness = (w.max(h) / 320).max(1) as i32;
    for bbox in dets {
        let color = Rgb(class_color(bbox.id()));
        let x = bbox.xmin().round() as i32;
        let y = bbox.ymin().round() as i32;
        let bw = bbox.width().round().max(1.0) as u32;
        let bh = bbox.height().round().max(1.0) as u32;

        // 加粗边框
        for t in 0..thickness {
            let (tw, th) = (bw as i32 - 2 * t, bh as i32 - 2 * t);
            if tw <= 0 || th <= 0 {
                break;
            }
            let rect = Rect::at(x + t, y + t).of_size(tw as u32, th as u32);
            draw_hollow_rect_mut(frame, rect, color);
        }

        let Some(font) = font else { continue };
        let name = names
            .get(bbox.id())
            .cloned()
            .unwrap_or_else(|| bbox.id().to_string());
        let label = format!("{} {:.2}", name, bbox.confidence());
        let scale = PxScale::from((h as f32 / 30.0).clamp(12.0, 32.0));
        let (tw, th) = imageproc::drawing::text_size(scale, font, &label);
        let ty = if y - th as i32 - 2 >= 0 {
            y - th as i32 - 2
        } else {
            y + 2
        };
        draw_filled_rect_mut(frame, Rect::at(x, ty).of_size(tw + 4, th + 2), color);
        draw_text_mut(frame, Rgb([255, 255, 255]), x + 2, ty, scale, font, &label);
    }
}

/// 鸟瞰掩码上色: 轮廓绿色, 行人红色, 其他障碍物橙色, 可行驶区域深灰
pub fn colorize_birdview(mask: &GrayImage, cfg: &PerceptionConfig) -> RgbImage {
    let edge = cfg.drivable.edge_value;
    let person = cfg.obstacles.person.value;
    let other = cfg.obstacles.other.value;
    RgbImage::from_fn(mask.width(), mask.height(), |x, y| {
        let v = mask.get_pixel(x, y).0[0];
        match v {
            0 => BACKGROUND,
            v if v == person => PERSON,
            v if v == other => OBSTACLE,
            v if v == edge => DRIVABLE_EDGE,
            _ => DRIVABLE_FILL,
        }
    })
}
