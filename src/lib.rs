#![allow(clippy::type_complexity)]
// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod birdview; // 鸟瞰图: 可行驶区域轮廓 + 障碍物栅格化
pub mod config; // 感知配置参数
pub mod models; // 模型接口与具体实现
pub mod ort_backend;
pub mod perception; // 感知系统 (分割 + 检测 + 透视变换)
pub mod pipeline; // 帧输入与结果输出
pub mod render; // 调试可视化
pub mod utils;

use serde::Serialize;

pub use crate::config::{Args, PerceptionConfig};
pub use crate::models::{
    Model, ModelType, SegmentationArch, SegmentationModel, SegmentationOutput, YOLOv8,
};
pub use crate::ort_backend::{OrtBackend, OrtConfig, OrtEP};
pub use crate::perception::{PerceptionOutput, PerceptionSystem};
pub use crate::utils::perspective::{PerspectiveMatrix, PerspectiveTransforms};

pub fn non_max_suppression(xs: &mut Vec<Bbox>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.confidence().total_cmp(&b1.confidence()));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = xs[prev_index].iou(&xs[index]);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

pub fn gen_time_string(delimiter: &str) -> String {
    let t_now = chrono::Local::now();
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S",
        delimiter, delimiter, delimiter, delimiter, delimiter
    );
    t_now.format(&fmt).to_string()
}

#[derive(Debug, PartialEq, Clone, Copy, Default, Serialize)]
pub struct Point2 {
    x: f32,
    y: f32,
}

impl Point2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn x(&self) -> f32 {
        self.x
    }

    pub fn y(&self) -> f32 {
        self.y
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Bbox {
    // a bounding box around an object
    xmin: f32,
    ymin: f32,
    width: f32,
    height: f32,
    id: usize,
    confidence: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32, id: usize, confidence: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
            id,
            confidence,
        }
    }

    /// 由左上/右下角点构造 (x1, y1, x2, y2)
    pub fn from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32, id: usize, confidence: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1, id, confidence)
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn xmin(&self) -> f32 {
        self.xmin
    }

    pub fn ymin(&self) -> f32 {
        self.ymin
    }

    pub fn xmax(&self) -> f32 {
        self.xmin + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.ymin + self.height
    }

    /// 底边中点 (目标与地面的接触点)
    pub fn ground_point(&self) -> Point2 {
        Point2::new((self.xmin + self.xmax()) / 2., self.ymax())
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin.max(another.xmin);
        let r = (self.xmin + self.width).min(another.xmin + another.width);
        let t = self.ymin.max(another.ymin);
        let b = (self.ymin + self.height).min(another.ymin + another.height);
        (r - l + 1.).max(0.) * (b - t + 1.).max(0.)
    }

    pub fn union(&self, another: &Bbox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    pub fn iou(&self, another: &Bbox) -> f32 {
        self.intersection_area(another) / self.union(another)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ground_point() {
        let b = Bbox::from_xyxy(10.0, 20.0, 30.0, 100.0, 0, 0.9);
        assert_eq!(b.ground_point(), Point2::new(20.0, 100.0));
        assert_eq!(b.width(), 20.0);
        assert_eq!(b.height(), 80.0);
    }

    #[test]
    fn test_nms_drops_overlapping_boxes() {
        let mut xs = vec![
            Bbox::new(0.0, 0.0, 100.0, 100.0, 0, 0.6),
            Bbox::new(2.0, 2.0, 100.0, 100.0, 0, 0.9),
            Bbox::new(300.0, 300.0, 50.0, 50.0, 2, 0.5),
        ];
        non_max_suppression(&mut xs, 0.45);
        assert_eq!(xs.len(), 2);
        assert_eq!(xs[0].confidence(), 0.9);
        assert_eq!(xs[1].id(), 2);
    }

    #[test]
    fn test_nms_keeps_disjoint_boxes() {
        let mut xs = vec![
            Bbox::new(0.0, 0.0, 10.0, 10.0, 0, 0.3),
            Bbox::new(50.0, 50.0, 10.0, 10.0, 0, 0.4),
        ];
        non_max_suppression(&mut xs, 0.45);
        assert_eq!(xs.len(), 2);
    }
}
