// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 模型统一接口与实现
///
/// # 架构说明
///
/// ## 完整模型实现 (Full Model Implementation)
/// - **YOLOv8**: 障碍物检测 (兼容 YOLOv5 输出布局)
/// - **SegmentationModel**: 语义分割 (FCHarDNet / PSPNet)
///
/// 两者都包含: 模型加载 (new)、预处理 (preprocess)、推理 (run)、后处理 (postprocess)
///
/// ## 后处理器模式 (Postprocessor Pattern)
/// 后处理不依赖推理引擎, 拆分为 `YOLOv8Postprocessor` / `SegmentationPostprocessor`,
/// 可以脱离模型文件单独测试。
use anyhow::Result;
use image::DynamicImage;
use ndarray::{Array, IxDyn};
use serde::{Deserialize, Serialize};

pub mod segmentation;
pub mod yolov8;

pub use segmentation::{
    SegmentationModel, SegmentationOutput, SegmentationPostprocessor, SegmentationPreprocess,
};
pub use yolov8::{YOLOv8, YOLOv8Config, YOLOv8Postprocessor};

/// 检测模型输出布局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelType {
    /// YOLOv5: [B, N, 5 + nc], 含 objectness
    YOLOv5,
    /// YOLOv8: [B, 4 + nc, N]
    YOLOv8,
}

impl ModelType {
    /// 从模型路径推断模型类型
    /// 只看文件名, 目录名不参与判断
    pub fn from_path(path: &str) -> Self {
        let name = std::path::Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.contains("yolov5") {
            ModelType::YOLOv5
        } else {
            ModelType::YOLOv8
        }
    }
}

/// 分割网络架构
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SegmentationArch {
    FCHarDNet,
    PSPNet,
}

impl From<String> for SegmentationArch {
    // 未知名称按 PSPNet 处理
    fn from(name: String) -> Self {
        match name.to_lowercase().as_str() {
            "fchardnet" | "hardnet" => SegmentationArch::FCHarDNet,
            _ => SegmentationArch::PSPNet,
        }
    }
}

impl From<SegmentationArch> for String {
    fn from(arch: SegmentationArch) -> Self {
        match arch {
            SegmentationArch::FCHarDNet => "fchardnet".to_string(),
            SegmentationArch::PSPNet => "pspnet".to_string(),
        }
    }
}

/// 张量通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// 统一的深度学习模型接口
///
/// ## 核心流程
/// ```text
/// 原始图片 → preprocess → ndarray张量
///          ↓
///     推理引擎 run
///          ↓
///     原始输出 → postprocess → Output
/// ```
pub trait Model {
    type Output;

    /// 预处理: 图片 → NCHW 张量
    fn preprocess(&mut self, images: &[DynamicImage]) -> Result<Vec<Array<f32, IxDyn>>>;

    /// 推理: 执行模型前向传播
    fn run(&mut self, xs: Vec<Array<f32, IxDyn>>, profile: bool) -> Result<Vec<Array<f32, IxDyn>>>;

    /// 后处理: 原始输出 → 结果
    ///
    /// * `xs0` - 原始图片(用于坐标还原)
    fn postprocess(
        &self,
        xs: Vec<Array<f32, IxDyn>>,
        xs0: &[DynamicImage],
    ) -> Result<Vec<Self::Output>>;

    /// 完整的推理流程: preprocess → run → postprocess
    fn forward(&mut self, images: &[DynamicImage], profile: bool) -> Result<Vec<Self::Output>> {
        let t_pre = std::time::Instant::now();
        let xs = self.preprocess(images)?;
        if profile {
            log::info!("[Preprocess]: {:?}", t_pre.elapsed());
        }

        let ys = self.run(xs, profile)?;

        let t_post = std::time::Instant::now();
        let ys = self.postprocess(ys, images)?;
        if profile {
            log::info!("[Postprocess]: {:?}", t_post.elapsed());
        }
        Ok(ys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_type_from_path() {
        assert_eq!(ModelType::from_path("models/yolov5s.onnx"), ModelType::YOLOv5);
        assert_eq!(ModelType::from_path("models/YOLOv8n.onnx"), ModelType::YOLOv8);
        assert_eq!(ModelType::from_path("det.onnx"), ModelType::YOLOv8);
        assert_eq!(
            ModelType::from_path("/data/models-v5/yolov8n.onnx"),
            ModelType::YOLOv8
        );
        assert_eq!(
            ModelType::from_path("/data/yolov5/YOLOv5m6.onnx"),
            ModelType::YOLOv5
        );
    }

    #[test]
    fn test_arch_names() {
        assert_eq!(
            SegmentationArch::from("FCHarDNet".to_string()),
            SegmentationArch::FCHarDNet
        );
        assert_eq!(
            SegmentationArch::from("pspnet".to_string()),
            SegmentationArch::PSPNet
        );
        assert_eq!(String::from(SegmentationArch::FCHarDNet), "fchardnet");
    }

    /// 不依赖推理引擎的模型: run 把张量乘 2, postprocess 取每张图的均值
    struct Doubler;

    impl Model for Doubler {
        type Output = f32;

        fn preprocess(&mut self, images: &[DynamicImage]) -> Result<Vec<Array<f32, IxDyn>>> {
            let mut x = Array::zeros((images.len(), 1)).into_dyn();
            for (i, img) in images.iter().enumerate() {
                x[[i, 0]] = img.width() as f32;
            }
            Ok(vec![x])
        }

        fn run(&mut self, xs: Vec<Array<f32, IxDyn>>, _profile: bool) -> Result<Vec<Array<f32, IxDyn>>> {
            Ok(xs.into_iter().map(|x| x * 2.0).collect())
        }

        fn postprocess(
            &self,
            xs: Vec<Array<f32, IxDyn>>,
            xs0: &[DynamicImage],
        ) -> Result<Vec<f32>> {
            Ok((0..xs0.len()).map(|i| xs[0][[i, 0]]).collect())
        }
    }

    #[test]
    fn test_forward_chains_stages() {
        let images = [DynamicImage::new_rgb8(3, 1), DynamicImage::new_rgb8(5, 1)];
        let ys = Doubler.forward(&images, true).unwrap();
        assert_eq!(ys, vec![6.0, 10.0]);
    }
}
