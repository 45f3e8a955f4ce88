// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 感知系统 (Perception System)
//
// 每帧流程:
//   语义分割 → 可行驶区域掩码 → 透视变换到鸟瞰图 → 机器人所在区域轮廓
//   目标检测 → 接地点投影 → 在鸟瞰图上画障碍物

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView, GrayImage, Luma, Rgb, RgbImage};
use std::time::{Duration, Instant};

use crate::birdview::{drivable_contour_mask, rasterize_detections, robot_center};
use crate::config::PerceptionConfig;
use crate::models::{SegmentationModel, SegmentationOutput, YOLOv8};
use crate::utils::perspective::{warp_perspective_gray_inv, BorderMode, InterpolationMethod};
use crate::{Bbox, OrtConfig, PerspectiveTransforms};

/// 可行驶区域分割接口
pub trait DrivableSegmenter {
    /// * `size` - 输出尺寸 (h, w)
    fn process_img_driveable(
        &mut self,
        img: &DynamicImage,
        size: (u32, u32),
        drivable_idx: &[u32],
    ) -> Result<SegmentationOutput>;
}

/// 障碍物检测接口
pub trait ObstacleDetector {
    /// 返回帧坐标下的检测框
    fn process_frame(&mut self, img: &DynamicImage) -> Result<Vec<Bbox>>;

    fn conf_thres(&self) -> f32;

    /// 模型输入尺寸 (h, w)
    fn im_hw(&self) -> (u32, u32);
}

impl DrivableSegmenter for SegmentationModel {
    fn process_img_driveable(
        &mut self,
        img: &DynamicImage,
        size: (u32, u32),
        drivable_idx: &[u32],
    ) -> Result<SegmentationOutput> {
        SegmentationModel::process_img_driveable(self, img, size, drivable_idx)
    }
}

impl ObstacleDetector for YOLOv8 {
    fn process_frame(&mut self, img: &DynamicImage) -> Result<Vec<Bbox>> {
        YOLOv8::process_frame(self, img)
    }

    fn conf_thres(&self) -> f32 {
        self.conf()
    }

    fn im_hw(&self) -> (u32, u32) {
        YOLOv8::im_hw(self)
    }
}

/// 各阶段耗时
#[derive(Debug, Clone, Copy, Default)]
pub struct StageTimings {
    pub segmentation: Duration,
    pub warp: Duration,
    pub detection: Duration,
    pub rasterize: Duration,
}

impl StageTimings {
    pub fn total(&self) -> Duration {
        self.segmentation + self.warp + self.detection + self.rasterize
    }
}

/// 单帧感知结果
#[derive(Debug, Clone)]
pub struct PerceptionOutput {
    /// 原始尺寸的可行驶区域 (255 / 0)
    pub drivable: GrayImage,
    /// 鸟瞰图中机器人所在的可行驶区域轮廓
    pub drivable_birdview: GrayImage,
    /// 帧坐标下的检测框
    pub detections: Vec<Bbox>,
    /// 轮廓 + 障碍物
    pub birdview_with_objects: GrayImage,
    /// 彩色分割图
    pub segmented: RgbImage,
    pub timings: StageTimings,
}

pub struct PerceptionSystem {
    config: PerceptionConfig,
    seg_model: Box<dyn DrivableSegmenter + Send>,
    object_detector: Box<dyn ObstacleDetector + Send>,
    transforms: PerspectiveTransforms,
}

impl PerceptionSystem {
    /// 加载模型与透视矩阵, 并用测试图片预热
    pub fn new(config: PerceptionConfig) -> Result<Self> {
        config.validate()?;
        let ep = config.execution.ort_ep();
        let ort = |path: &std::path::Path| OrtConfig {
            f: path.to_path_buf(),
            ep,
            trt_fp16: config.execution.trt_fp16,
            intra_threads: config.execution.intra_threads,
        };

        let seg_model = SegmentationModel::new(
            ort(&config.model_path),
            config.model_name,
            &config.segmentation,
            config.profile,
        )
        .with_context(|| format!("加载分割模型失败 {}", config.model_path.display()))?;
        seg_model.summary();

        let object_detector = YOLOv8::new(ort(&config.model_path_yolo), &config.detector, config.profile)
            .with_context(|| format!("加载检测模型失败 {}", config.model_path_yolo.display()))?;
        object_detector.summary();

        let transforms = PerspectiveTransforms::load(&config.perspective_transform_path)?;

        let mut system = Self::with_models(
            config,
            Box::new(seg_model),
            Box::new(object_detector),
            transforms,
        );
        log::info!("✅ 分割与检测模型已加载, 开始测试模型");
        system.warmup()?;
        log::info!("✅ 模型测试完成");
        Ok(system)
    }

    /// 使用外部提供的模型构建
    pub fn with_models(
        config: PerceptionConfig,
        seg_model: Box<dyn DrivableSegmenter + Send>,
        object_detector: Box<dyn ObstacleDetector + Send>,
        transforms: PerspectiveTransforms,
    ) -> Self {
        Self {
            config,
            seg_model,
            object_detector,
            transforms,
        }
    }

    /// 在测试图片上跑一遍两个模型
    pub fn warmup(&mut self) -> Result<()> {
        let img = match &self.config.warmup_image {
            Some(path) => image::open(path)
                .with_context(|| format!("无法读取预热图片 {}", path.display()))?,
            None => DynamicImage::ImageRgb8(RgbImage::from_pixel(
                self.config.original_width,
                self.config.original_height,
                Rgb([114, 114, 114]),
            )),
        };
        let t = Instant::now();
        self.seg_model.process_img_driveable(
            &img,
            self.original_hw(),
            &self.config.drivable_idx,
        )?;
        self.object_detector.process_frame(&img)?;
        let (h, w) = self.object_detector.im_hw();
        log::debug!("warmup took {:?}, detector input {}x{}", t.elapsed(), w, h);
        Ok(())
    }

    pub fn config(&self) -> &PerceptionConfig {
        &self.config
    }

    pub fn transforms(&self) -> &PerspectiveTransforms {
        &self.transforms
    }

    fn original_hw(&self) -> (u32, u32) {
        (self.config.original_height, self.config.original_width)
    }

    /// 原始尺寸的可行驶区域 → 鸟瞰图轮廓掩码
    pub fn get_driveable(&self, drivable: &GrayImage) -> Result<GrayImage> {
        let (w, h) = drivable.dimensions();
        let warped = warp_perspective_gray_inv(
            drivable,
            &self.transforms.m_inv,
            (self.config.birdview_width, self.config.birdview_height),
            InterpolationMethod::Bilinear,
            BorderMode::Constant(0),
        );
        let center = robot_center(&self.transforms.m, w, h);
        Ok(drivable_contour_mask(&warped, center, &self.config.drivable))
    }

    /// 将检测结果画入鸟瞰掩码
    ///
    /// * `frame_wh` - 检测所用帧的尺寸, 用于换算到分割原始尺寸
    pub fn add_detections_birdview(
        &self,
        preds: &[Bbox],
        frame_wh: (u32, u32),
        mask: &mut GrayImage,
    ) -> usize {
        let (fw, fh) = frame_wh;
        let rates = (
            self.config.original_width as f64 / fw.max(1) as f64,
            self.config.original_height as f64 / fh.max(1) as f64,
        );
        rasterize_detections(
            mask,
            preds,
            &self.transforms.m,
            rates,
            self.object_detector.conf_thres(),
            &self.config.obstacles,
        )
    }

    pub fn process_frame(&mut self, img: &DynamicImage) -> Result<PerceptionOutput> {
        let mut timings = StageTimings::default();

        // 语义分割
        let start = Instant::now();
        let seg = self.seg_model.process_img_driveable(
            img,
            self.original_hw(),
            &self.config.drivable_idx,
        )?;
        timings.segmentation = start.elapsed();

        // 鸟瞰可行驶区域
        let start = Instant::now();
        let drivable_birdview = self.get_driveable(&seg.drivable)?;
        timings.warp = start.elapsed();

        // 目标检测
        let start = Instant::now();
        let detections = self.object_detector.process_frame(img)?;
        timings.detection = start.elapsed();

        let start = Instant::now();
        let mut birdview_with_objects = drivable_birdview.clone();
        let drawn =
            self.add_detections_birdview(&detections, img.dimensions(), &mut birdview_with_objects);
        timings.rasterize = start.elapsed();

        let log_level = if self.config.profile {
            log::Level::Info
        } else {
            log::Level::Debug
        };
        log::log!(
            log_level,
            "segmentation: {:?}, warp: {:?}, detection: {:?} ({} dets, {} drawn), rasterize: {:?}",
            timings.segmentation,
            timings.warp,
            timings.detection,
            detections.len(),
            drawn,
            timings.rasterize
        );

        Ok(PerceptionOutput {
            drivable: seg.drivable,
            drivable_birdview,
            detections,
            birdview_with_objects,
            segmented: seg.segmented,
            timings,
        })
    }
}

/// 单通道掩码的像素统计, 用于日志与测试
pub fn count_value(mask: &GrayImage, value: u8) -> usize {
    mask.pixels().filter(|p| **p == Luma([value])).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SegmentationPostprocessor;
    use crate::PerspectiveMatrix;
    use std::sync::{Arc, Mutex};

    /// 下半部分为道路 (类别 0), 上半部分为建筑 (类别 2)
    struct FakeSegmenter {
        calls: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    impl DrivableSegmenter for FakeSegmenter {
        fn process_img_driveable(
            &mut self,
            img: &DynamicImage,
            size: (u32, u32),
            drivable_idx: &[u32],
        ) -> Result<SegmentationOutput> {
            self.calls.lock().unwrap().push(img.dimensions());
            let (h, w) = size;
            let class_map = crate::models::segmentation::ClassMap::from_fn(w, h, |_, y| {
                Luma([if y >= h / 2 { 0 } else { 2 }])
            });
            Ok(SegmentationOutput {
                segmented: SegmentationPostprocessor::colorize(&class_map),
                drivable: SegmentationPostprocessor::drivable_mask(&class_map, drivable_idx),
                class_map,
            })
        }
    }

    struct FakeDetector {
        boxes: Vec<Bbox>,
    }

    impl ObstacleDetector for FakeDetector {
        fn process_frame(&mut self, _img: &DynamicImage) -> Result<Vec<Bbox>> {
            Ok(self.boxes.clone())
        }

        fn conf_thres(&self) -> f32 {
            0.25
        }

        fn im_hw(&self) -> (u32, u32) {
            (640, 640)
        }
    }

    fn config() -> PerceptionConfig {
        PerceptionConfig {
            original_width: 64,
            original_height: 48,
            birdview_width: 64,
            birdview_height: 48,
            ..Default::default()
        }
    }

    fn system(boxes: Vec<Bbox>) -> (PerceptionSystem, Arc<Mutex<Vec<(u32, u32)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let transforms = PerspectiveTransforms::new(PerspectiveMatrix::identity()).unwrap();
        let system = PerceptionSystem::with_models(
            config(),
            Box::new(FakeSegmenter {
                calls: calls.clone(),
            }),
            Box::new(FakeDetector { boxes }),
            transforms,
        );
        (system, calls)
    }

    fn frame(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([10, 20, 30])))
    }

    #[test]
    fn test_process_frame_without_detections() {
        let (mut sys, calls) = system(vec![]);
        let out = sys.process_frame(&frame(64, 48)).unwrap();
        assert_eq!(out.drivable.dimensions(), (64, 48));
        assert_eq!(out.segmented.dimensions(), (64, 48));
        assert_eq!(out.drivable_birdview.dimensions(), (64, 48));
        assert!(out.detections.is_empty());
        assert_eq!(out.birdview_with_objects, out.drivable_birdview);
        // 道路区域上边界被画成轮廓
        assert_eq!(out.drivable_birdview.get_pixel(32, 24).0[0], 254);
        assert_eq!(out.drivable_birdview.get_pixel(32, 10).0[0], 0);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_process_frame_scales_detections() {
        // 帧 128x96, 原始尺寸 64x48 → rates 0.5
        let boxes = vec![
            Bbox::from_xyxy(50.0, 40.0, 70.0, 80.0, 0, 0.9),
            Bbox::from_xyxy(0.0, 0.0, 10.0, 10.0, 3, 0.1),
        ];
        let (mut sys, _) = system(boxes);
        let out = sys.process_frame(&frame(128, 96)).unwrap();
        assert_eq!(out.detections.len(), 2);
        // 接地点 (60, 80) * 0.5 = (30, 40)
        assert_eq!(out.birdview_with_objects.get_pixel(30, 40).0[0], 253);
        assert_eq!(out.birdview_with_objects.get_pixel(10, 0).0[0], 253);
        assert_eq!(out.birdview_with_objects.get_pixel(51, 40).0[0], 0);
        // 低分检测不画
        assert_eq!(count_value(&out.birdview_with_objects, 255), 0);
        // 输出尺寸与输入帧无关
        assert_eq!(out.drivable.dimensions(), (64, 48));
        // 原鸟瞰图不被修改
        assert_eq!(out.drivable_birdview.get_pixel(30, 40).0[0], 0);
    }

    #[test]
    fn test_warmup_uses_synthetic_frame() {
        let (mut sys, calls) = system(vec![]);
        sys.warmup().unwrap();
        assert_eq!(calls.lock().unwrap()[0], (64, 48));
    }

    #[test]
    fn test_get_driveable_with_scaling_transform() {
        let (mut sys, _) = system(vec![]);
        sys.transforms =
            PerspectiveTransforms::new(PerspectiveMatrix::from_array([
                [0.5, 0.0, 0.0],
                [0.0, 0.5, 0.0],
                [0.0, 0.0, 1.0],
            ]))
            .unwrap();
        let drivable = GrayImage::from_fn(64, 48, |_, y| Luma([if y >= 24 { 255 } else { 0 }]));
        let bv = sys.get_driveable(&drivable).unwrap();
        assert_eq!(bv.dimensions(), (64, 48));
        // 缩小一半: 可行驶区域 x 0..32, y 12..24
        assert_eq!(bv.get_pixel(16, 12).0[0], 254);
        assert_eq!(bv.get_pixel(16, 30).0[0], 0);
        assert_eq!(bv.get_pixel(50, 20).0[0], 0);
    }
}
