// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 障碍物检测模型 (兼容 YOLOv5 输出布局)
// 包含: 模型加载、预处理、推理、后处理

use anyhow::{bail, Result};
use image::{DynamicImage, GenericImageView};
use ndarray::{s, Array, ArrayView1, Axis, Ix1, IxDyn};

use crate::config::DetectorConfig;
use crate::models::{Model, ModelType};
use crate::{non_max_suppression, Bbox, OrtBackend, OrtConfig, OrtEP};

/// YOLOv8 完整模型结构
pub struct YOLOv8 {
    engine: OrtBackend,
    post: YOLOv8Postprocessor,
    names: Vec<String>,
    profile: bool,
}

impl YOLOv8 {
    /// 从配置创建检测模型
    pub fn new(ort: OrtConfig, config: &DetectorConfig, profile: bool) -> Result<Self> {
        let layout = config
            .layout
            .unwrap_or_else(|| ModelType::from_path(&ort.f.to_string_lossy()));
        let engine = OrtBackend::build(ort)?;

        let post = YOLOv8Postprocessor::new(YOLOv8Config {
            layout,
            nc: config.nc() as usize,
            conf: config.conf_thres,
            iou: config.iou_thres,
            width: config.input_size as usize,
            height: config.input_size as usize,
        });

        Ok(Self {
            engine,
            post,
            names: config.names.clone(),
            profile,
        })
    }

    /// 输入尺寸 (h, w)
    pub fn im_hw(&self) -> (u32, u32) {
        (self.height(), self.width())
    }

    /// 批量检测, 返回原图坐标下的检测框
    pub fn detect(&mut self, xs: &[DynamicImage]) -> Result<Vec<Vec<Bbox>>> {
        let profile = self.profile;
        self.forward(xs, profile)
    }

    /// 单帧检测, 返回原图坐标下的检测框
    pub fn process_frame(&mut self, img: &DynamicImage) -> Result<Vec<Bbox>> {
        let mut ys = self.detect(std::slice::from_ref(img))?;
        Ok(ys.pop().unwrap_or_default())
    }

    pub fn summary(&self) {
        log::info!(
            "Detector Summary: > Layout: {:?} > EP: {:?}{} > Height: {} Width: {} > nc: {}, conf: {}, iou: {}",
            self.post.config.layout,
            self.engine.ep(),
            if let OrtEP::CPU = self.engine.ep() {
                ""
            } else {
                " (May still fall back to CPU)"
            },
            self.height(),
            self.width(),
            self.post.config.nc,
            self.post.config.conf,
            self.post.config.iou,
        );
    }

    pub fn engine(&self) -> &OrtBackend {
        &self.engine
    }

    pub fn conf(&self) -> f32 {
        self.post.config.conf
    }

    pub fn set_conf(&mut self, val: f32) {
        self.post.config.conf = val;
    }

    pub fn iou(&self) -> f32 {
        self.post.config.iou
    }

    pub fn width(&self) -> u32 {
        self.post.config.width as u32
    }

    pub fn height(&self) -> u32 {
        self.post.config.height as u32
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Model for YOLOv8 {
    type Output = Vec<Bbox>;

    fn preprocess(&mut self, images: &[DynamicImage]) -> Result<Vec<Array<f32, IxDyn>>> {
        Ok(vec![letterbox(images, self.width(), self.height())])
    }

    fn run(&mut self, mut xs: Vec<Array<f32, IxDyn>>, profile: bool) -> Result<Vec<Array<f32, IxDyn>>> {
        match xs.pop() {
            Some(x) => self.engine.run(x, profile),
            None => bail!("detector received no input tensor"),
        }
    }

    fn postprocess(
        &self,
        xs: Vec<Array<f32, IxDyn>>,
        xs0: &[DynamicImage],
    ) -> Result<Vec<Vec<Bbox>>> {
        let sizes: Vec<(u32, u32)> = xs0.iter().map(|x| x.dimensions()).collect();
        self.post.postprocess(&xs, &sizes)
    }
}

/// Letterbox 预处理: 等比缩放到左上角, 右侧与底部填充 144/255, RGB 归一化到 [0, 1]
///
/// 返回 `[N, 3, height, width]`
pub fn letterbox(xs: &[DynamicImage], width: u32, height: u32) -> Array<f32, IxDyn> {
    let mut ys = Array::ones((xs.len(), 3, height as usize, width as usize)).into_dyn();
    ys.fill(144.0 / 255.0);
    for (idx, x) in xs.iter().enumerate() {
        let (w0, h0) = x.dimensions();
        if w0 == 0 || h0 == 0 {
            continue;
        }
        let (_, w_new, h_new) = scale_wh(w0 as f32, h0 as f32, width as f32, height as f32);
        let img = x.resize_exact(
            (w_new as u32).clamp(1, width.max(1)),
            (h_new as u32).clamp(1, height.max(1)),
            image::imageops::FilterType::Triangle,
        );

        for (x, y, rgb) in img.pixels() {
            let x = x as usize;
            let y = y as usize;
            let [r, g, b, _] = rgb.0;
            ys[[idx, 0, y, x]] = (r as f32) / 255.0;
            ys[[idx, 1, y, x]] = (g as f32) / 255.0;
            ys[[idx, 2, y, x]] = (b as f32) / 255.0;
        }
    }
    ys
}

/// 等比缩放: 返回 (ratio, 新宽, 新高)
pub(crate) fn scale_wh(w0: f32, h0: f32, w1: f32, h1: f32) -> (f32, f32, f32) {
    let r = (w1 / w0).min(h1 / h0);
    (r, (w0 * r).round(), (h0 * r).round())
}

#[derive(Debug, Clone)]
pub struct YOLOv8Config {
    pub layout: ModelType,
    pub nc: usize,
    pub conf: f32,
    pub iou: f32,
    pub width: usize,
    pub height: usize,
}

/// YOLO 后处理器: 解码 → 置信度过滤 → 坐标还原 → NMS
pub struct YOLOv8Postprocessor {
    config: YOLOv8Config,
}

impl YOLOv8Postprocessor {
    pub fn new(config: YOLOv8Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &YOLOv8Config {
        &self.config
    }

    /// * `xs` - 模型输出, 只使用第一个
    /// * `sizes` - 每张原图的 (宽, 高)
    pub fn postprocess(
        &self,
        xs: &[Array<f32, IxDyn>],
        sizes: &[(u32, u32)],
    ) -> Result<Vec<Vec<Bbox>>> {
        const CXYWH_OFFSET: usize = 4;

        let Some(preds) = xs.first() else {
            bail!("detector produced no outputs");
        };
        if preds.ndim() != 3 {
            bail!("unexpected detector output shape {:?}", preds.shape());
        }
        let (cls_offset, expected) = match self.config.layout {
            ModelType::YOLOv8 => (CXYWH_OFFSET, CXYWH_OFFSET + self.config.nc),
            ModelType::YOLOv5 => (CXYWH_OFFSET + 1, CXYWH_OFFSET + 1 + self.config.nc),
        };
        let pred_axis = match self.config.layout {
            ModelType::YOLOv8 => Axis(1),
            ModelType::YOLOv5 => Axis(0),
        };

        let mut ys = Vec::new();
        for (idx, anchor) in preds.axis_iter(Axis(0)).enumerate() {
            let Some(&(w0, h0)) = sizes.get(idx) else {
                bail!("missing original size for batch index {}", idx);
            };
            let width_original = w0 as f32;
            let height_original = h0 as f32;
            let ratio = (self.config.width as f32 / width_original)
                .min(self.config.height as f32 / height_original);

            let mut data: Vec<Bbox> = Vec::new();
            for pred in anchor.axis_iter(pred_axis) {
                let pred = pred.into_dimensionality::<Ix1>()?;
                if pred.len() < expected {
                    bail!(
                        "detector prediction has {} values, expected at least {}",
                        pred.len(),
                        expected
                    );
                }
                let Some((id, confidence)) = self.score(&pred, cls_offset) else {
                    continue;
                };
                if confidence < self.config.conf {
                    continue;
                }

                let cx = pred[0] / ratio;
                let cy = pred[1] / ratio;
                let w = pred[2] / ratio;
                let h = pred[3] / ratio;
                let x = cx - w / 2.;
                let y = cy - h / 2.;
                data.push(Bbox::new(
                    x.max(0.0f32).min(width_original),
                    y.max(0.0f32).min(height_original),
                    w,
                    h,
                    id,
                    confidence,
                ));
            }

            non_max_suppression(&mut data, self.config.iou);
            ys.push(data);
        }

        Ok(ys)
    }

    fn score(&self, pred: &ArrayView1<f32>, cls_offset: usize) -> Option<(usize, f32)> {
        let clss = pred.slice(s![cls_offset..cls_offset + self.config.nc]);
        let (id, &cls) = clss
            .into_iter()
            .enumerate()
            .reduce(|max, x| if x.1 > max.1 { x } else { max })?;
        match self.config.layout {
            ModelType::YOLOv8 => Some((id, cls)),
            ModelType::YOLOv5 => Some((id, cls * pred[CXYWH_OBJ])),
        }
    }
}

const CXYWH_OBJ: usize = 4;
