// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 感知配置 - 命令行参数 + JSON配置文件

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::{ChannelOrder, ModelType, SegmentationArch};
use crate::OrtEP;

/// 鸟瞰可行驶区域感知 (Bird's-eye drivable area perception)
#[derive(Parser, Clone, Debug)]
#[command(author, version, about = "分割 + 检测 → 鸟瞰可行驶区域图", long_about = None)]
pub struct Args {
    /// JSON配置文件
    #[arg(short, long, default_value = "perception.json")]
    pub config: PathBuf,

    /// 输入图片或图片目录
    #[arg(short, long, default_value = "")]
    pub source: String,

    /// 输出目录 (默认 runs/<时间戳>)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// 使用 CUDA
    #[arg(long)]
    pub cuda: bool,

    /// 使用 TensorRT
    #[arg(long)]
    pub trt: bool,

    /// 设备 id
    #[arg(long, default_value_t = 0)]
    pub device_id: i32,

    /// 打印各阶段耗时
    #[arg(long)]
    pub profile: bool,

    /// 写入默认配置到 --config 后退出
    #[arg(long)]
    pub init_config: bool,

    /// 不输出检测框叠加图
    #[arg(long)]
    pub no_overlay: bool,
}

impl Args {
    /// 将命令行覆盖项写入配置
    pub fn apply_overrides(&self, config: &mut PerceptionConfig) {
        if self.trt {
            config.execution.ep = ExecutionKind::Trt;
        } else if self.cuda {
            config.execution.ep = ExecutionKind::Cuda;
        }
        if self.trt || self.cuda {
            config.execution.device_id = self.device_id;
        }
        if self.profile {
            config.profile = true;
        }
    }
}

/// 推理后端
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionKind {
    #[default]
    Cpu,
    Cuda,
    Trt,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub ep: ExecutionKind,
    pub device_id: i32,
    pub trt_fp16: bool,
    pub intra_threads: Option<usize>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            ep: ExecutionKind::Cpu,
            device_id: 0,
            trt_fp16: false,
            intra_threads: None,
        }
    }
}

impl ExecutionConfig {
    pub fn ort_ep(&self) -> OrtEP {
        match self.ep {
            ExecutionKind::Cpu => OrtEP::CPU,
            ExecutionKind::Cuda => OrtEP::CUDA(self.device_id),
            ExecutionKind::Trt => OrtEP::Trt(self.device_id),
        }
    }
}

/// 分割模型预处理覆盖项 (未设置时使用架构默认值)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SegmentationOverrides {
    pub input_width: Option<u32>,
    pub input_height: Option<u32>,
    pub mean: Option<[f32; 3]>,
    pub std: Option<[f32; 3]>,
    pub channel_order: Option<ChannelOrder>,
}

/// 检测模型参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    pub conf_thres: f32,
    pub iou_thres: f32,
    pub input_size: u32,
    /// 类别数 (未设置时按 names 长度)
    pub nc: Option<u32>,
    /// 输出布局 (未设置时按文件名推断)
    pub layout: Option<ModelType>,
    pub names: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            conf_thres: 0.25,
            iou_thres: 0.45,
            input_size: 640,
            nc: None,
            layout: None,
            names: COCO_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl DetectorConfig {
    pub fn nc(&self) -> u32 {
        self.nc.unwrap_or(self.names.len() as u32)
    }
}

/// 可行驶区域轮廓提取参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DrivableConfig {
    /// 变换后灰度阈值 (> threshold 视为可行驶)
    pub threshold: u8,
    /// 轮廓像素值
    pub edge_value: u8,
    /// 区域填充值 (None 表示只画轮廓)
    pub fill_value: Option<u8>,
    /// 机器人中心不在可行驶区域时的搜索半径 (像素)
    pub seed_search_radius: u32,
    /// 最小连通域面积
    pub min_area: u32,
}

impl Default for DrivableConfig {
    fn default() -> Self {
        Self {
            threshold: 127,
            edge_value: 254,
            fill_value: None,
            seed_search_radius: 60,
            min_area: 0,
        }
    }
}

/// 障碍物在鸟瞰图上的占位 (像素)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObstacleStyle {
    pub width: u32,
    pub height: u32,
    pub value: u8,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObstacleConfig {
    pub person_class: usize,
    pub person: ObstacleStyle,
    pub other: ObstacleStyle,
}

impl Default for ObstacleConfig {
    fn default() -> Self {
        Self {
            person_class: 0,
            person: ObstacleStyle {
                width: 40,
                height: 60,
                value: 253,
            },
            other: ObstacleStyle {
                width: 30,
                height: 90,
                value: 255,
            },
        }
    }
}

impl ObstacleConfig {
    pub fn style_for(&self, class_id: usize) -> &ObstacleStyle {
        if class_id == self.person_class {
            &self.person
        } else {
            &self.other
        }
    }
}

/// 感知系统配置
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PerceptionConfig {
    pub model_name: SegmentationArch,
    pub model_path: PathBuf,
    pub model_path_yolo: PathBuf,
    pub perspective_transform_path: PathBuf,
    pub original_height: u32,
    pub original_width: u32,
    pub drivable_idx: Vec<u32>,
    pub birdview_width: u32,
    pub birdview_height: u32,
    pub segmentation: SegmentationOverrides,
    pub detector: DetectorConfig,
    pub drivable: DrivableConfig,
    pub obstacles: ObstacleConfig,
    pub execution: ExecutionConfig,
    pub warmup_image: Option<PathBuf>,
    pub font_path: Option<PathBuf>,
    pub profile: bool,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            model_name: SegmentationArch::FCHarDNet,
            model_path: PathBuf::from("models/hardnet70_cityscapes.onnx"),
            model_path_yolo: PathBuf::from("models/yolov5s.onnx"),
            perspective_transform_path: PathBuf::from("perspective_transform.json"),
            original_height: 480,
            original_width: 640,
            drivable_idx: vec![0, 1],
            birdview_width: 480,
            birdview_height: 480,
            segmentation: SegmentationOverrides::default(),
            detector: DetectorConfig::default(),
            drivable: DrivableConfig::default(),
            obstacles: ObstacleConfig::default(),
            execution: ExecutionConfig::default(),
            warmup_image: None,
            font_path: None,
            profile: false,
        }
    }
}

impl PerceptionConfig {
    /// 从JSON文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件 {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("配置文件解析失败 {}", path.display()))?;
        config.validate()?;
        log::info!("✅ 配置已从 {} 加载", path.display());
        Ok(config)
    }

    /// 保存配置到JSON文件
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("保存配置失败 {}", path.display()))?;
        log::info!("💾 配置已保存到 {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.original_width == 0 || self.original_height == 0 {
            bail!(
                "original size must be non-zero, got {}x{}",
                self.original_width,
                self.original_height
            );
        }
        if self.birdview_width == 0 || self.birdview_height == 0 {
            bail!(
                "birdview size must be non-zero, got {}x{}",
                self.birdview_width,
                self.birdview_height
            );
        }
        if self.drivable_idx.is_empty() {
            bail!("drivable_idx must name at least one segmentation class");
        }
        for (name, v) in [
            ("detector.conf_thres", self.detector.conf_thres),
            ("detector.iou_thres", self.detector.iou_thres),
        ] {
            if !(0.0..=1.0).contains(&v) {
                bail!("{} must be in [0, 1], got {}", name, v);
            }
        }
        if self.detector.input_size == 0 {
            bail!("detector.input_size must be non-zero");
        }
        if self.detector.nc() == 0 {
            bail!("detector needs `nc` or a non-empty `names` list");
        }
        Ok(())
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        log::info!("🎛️  当前感知配置:");
        log::info!("  分割模型: {:?} ({})", self.model_name, self.model_path.display());
        log::info!("  检测模型: {}", self.model_path_yolo.display());
        log::info!(
            "  透视变换: {}",
            self.perspective_transform_path.display()
        );
        log::info!(
            "  原始尺寸: {}x{}, 鸟瞰尺寸: {}x{}",
            self.original_width,
            self.original_height,
            self.birdview_width,
            self.birdview_height
        );
        log::info!("  可行驶类别: {:?}", self.drivable_idx);
        log::info!(
            "  检测置信度: {:.2}, IOU: {:.2}",
            self.detector.conf_thres,
            self.detector.iou_thres
        );
        log::info!("  推理后端: {:?}", self.execution.ort_ep());
    }
}

pub const COCO_NAMES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];
