// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 语义分割模型 (FCHarDNet / PSPNet)
// 输出: 类别图、彩色分割图、可行驶区域掩码

use anyhow::{bail, Result};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use ndarray::{Array, ArrayView2, ArrayView3, Ix2, Ix3, Ix4, IxDyn};

use crate::config::SegmentationOverrides;
use crate::models::{ChannelOrder, Model, SegmentationArch};
use crate::{OrtBackend, OrtConfig, OrtEP};

/// 每像素类别 id
pub type ClassMap = ImageBuffer<Luma<u16>, Vec<u16>>;

/// 分割结果
#[derive(Debug, Clone)]
pub struct SegmentationOutput {
    pub class_map: ClassMap,
    /// 彩色分割图 (调色板着色)
    pub segmented: RgbImage,
    /// 可行驶区域: 255 可行驶, 0 不可行驶
    pub drivable: GrayImage,
}

/// 分割预处理参数
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationPreprocess {
    pub width: u32,
    pub height: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub channel_order: ChannelOrder,
}

impl SegmentationPreprocess {
    /// 各架构训练时使用的输入设置
    pub fn for_arch(arch: SegmentationArch) -> Self {
        match arch {
            // Cityscapes 1024x512, BGR 顺序的 ImageNet 均值方差
            SegmentationArch::FCHarDNet => Self {
                width: 1024,
                height: 512,
                mean: [0.406, 0.456, 0.485],
                std: [0.225, 0.224, 0.229],
                channel_order: ChannelOrder::Bgr,
            },
            SegmentationArch::PSPNet => Self {
                width: 713,
                height: 713,
                mean: [0.485, 0.456, 0.406],
                std: [0.229, 0.224, 0.225],
                channel_order: ChannelOrder::Rgb,
            },
        }
    }

    pub fn with_overrides(mut self, o: &SegmentationOverrides) -> Self {
        if let Some(w) = o.input_width {
            self.width = w;
        }
        if let Some(h) = o.input_height {
            self.height = h;
        }
        if let Some(mean) = o.mean {
            self.mean = mean;
        }
        if let Some(std) = o.std {
            self.std = std;
        }
        if let Some(order) = o.channel_order {
            self.channel_order = order;
        }
        self
    }

    /// 图片 → [N, 3, H, W] 归一化张量
    pub fn apply(&self, xs: &[DynamicImage]) -> Array<f32, IxDyn> {
        let mut ys =
            Array::zeros((xs.len(), 3, self.height as usize, self.width as usize)).into_dyn();
        for (idx, x) in xs.iter().enumerate() {
            let img = x
                .resize_exact(self.width, self.height, image::imageops::FilterType::Triangle)
                .into_rgb8();
            for (x, y, rgb) in img.enumerate_pixels() {
                let [r, g, b] = rgb.0;
                let chans = match self.channel_order {
                    ChannelOrder::Rgb => [r, g, b],
                    ChannelOrder::Bgr => [b, g, r],
                };
                for (c, v) in chans.iter().enumerate() {
                    ys[[idx, c, y as usize, x as usize]] =
                        ((*v as f32) / 255.0 - self.mean[c]) / self.std[c];
                }
            }
        }
        ys
    }
}

/// 语义分割模型
pub struct SegmentationModel {
    engine: OrtBackend,
    arch: SegmentationArch,
    pre: SegmentationPreprocess,
    post: SegmentationPostprocessor,
    profile: bool,
}

impl SegmentationModel {
    pub fn new(
        ort: OrtConfig,
        arch: SegmentationArch,
        overrides: &SegmentationOverrides,
        profile: bool,
    ) -> Result<Self> {
        let engine = OrtBackend::build(ort)?;
        Ok(Self {
            engine,
            arch,
            pre: SegmentationPreprocess::for_arch(arch).with_overrides(overrides),
            post: SegmentationPostprocessor,
            profile,
        })
    }

    pub fn arch(&self) -> SegmentationArch {
        self.arch
    }

    pub fn preprocess_config(&self) -> &SegmentationPreprocess {
        &self.pre
    }

    /// 单帧分割, 类别图缩放到 `size` = (h, w)
    pub fn process_img_driveable(
        &mut self,
        img: &DynamicImage,
        size: (u32, u32),
        drivable_idx: &[u32],
    ) -> Result<SegmentationOutput> {
        let profile = self.profile;
        let mut maps = self.forward(std::slice::from_ref(img), profile)?;
        if maps.is_empty() {
            bail!("segmentation model produced no class map");
        }
        let (h, w) = size;
        let class_map = SegmentationPostprocessor::resize_nearest(&maps.swap_remove(0), w, h);
        Ok(SegmentationOutput {
            segmented: SegmentationPostprocessor::colorize(&class_map),
            drivable: SegmentationPostprocessor::drivable_mask(&class_map, drivable_idx),
            class_map,
        })
    }

    pub fn summary(&self) {
        log::info!(
            "Segmentation Summary: > Arch: {:?} > EP: {:?}{} > Input: {}x{} ({:?})",
            self.arch,
            self.engine.ep(),
            if let OrtEP::CPU = self.engine.ep() {
                ""
            } else {
                " (May still fall back to CPU)"
            },
            self.pre.width,
            self.pre.height,
            self.pre.channel_order,
        );
    }
}

impl Model for SegmentationModel {
    type Output = ClassMap;

    fn preprocess(&mut self, images: &[DynamicImage]) -> Result<Vec<Array<f32, IxDyn>>> {
        Ok(vec![self.pre.apply(images)])
    }

    fn run(&mut self, mut xs: Vec<Array<f32, IxDyn>>, profile: bool) -> Result<Vec<Array<f32, IxDyn>>> {
        match xs.pop() {
            Some(x) => self.engine.run(x, profile),
            None => bail!("segmentation received no input tensor"),
        }
    }

    /// 每张图一张模型分辨率的类别图, 缩放由调用方决定
    fn postprocess(
        &self,
        xs: Vec<Array<f32, IxDyn>>,
        xs0: &[DynamicImage],
    ) -> Result<Vec<ClassMap>> {
        let Some(logits) = xs.first() else {
            bail!("segmentation model produced no outputs");
        };
        let mut ys = self.post.class_maps(logits)?;
        if ys.len() < xs0.len() {
            bail!(
                "segmentation output batch {} < input batch {}",
                ys.len(),
                xs0.len()
            );
        }
        ys.truncate(xs0.len());
        Ok(ys)
    }
}

/// 分割后处理器: argmax → 缩放 → 着色/掩码
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentationPostprocessor;

impl SegmentationPostprocessor {
    /// 模型输出 → 类别图 (取 batch 第一张)
    ///
    /// 支持 `[1, C, H, W]` logits, 以及已 argmax 的 `[1, H, W]` / `[H, W]`
    pub fn class_map(&self, logits: &Array<f32, IxDyn>) -> Result<ClassMap> {
        let mut maps = self.class_maps(logits)?;
        if maps.is_empty() {
            bail!("empty segmentation output {:?}", logits.shape());
        }
        Ok(maps.swap_remove(0))
    }

    /// 整个 batch 的类别图, `[H, W]` 视为单张
    pub fn class_maps(&self, logits: &Array<f32, IxDyn>) -> Result<Vec<ClassMap>> {
        let shape = logits.shape();
        let empty = match shape.len() {
            4 => shape.iter().any(|&d| d == 0),
            3 => shape[0] == 0 || shape[1] == 0 || shape[2] == 0,
            2 => shape[0] == 0 || shape[1] == 0,
            _ => bail!("unexpected segmentation output shape {:?}", shape),
        };
        if empty {
            bail!("empty segmentation output {:?}", shape);
        }
        match logits.ndim() {
            4 => {
                let x = logits.view().into_dimensionality::<Ix4>()?;
                Ok(x.outer_iter().map(Self::argmax_map).collect())
            }
            3 => {
                let x = logits.view().into_dimensionality::<Ix3>()?;
                Ok(x.outer_iter().map(Self::ids_to_map).collect())
            }
            _ => Ok(vec![Self::ids_to_map(
                logits.view().into_dimensionality::<Ix2>()?,
            )]),
        }
    }

    fn argmax_map(x: ArrayView3<f32>) -> ClassMap {
        let (_, h, w) = x.dim();
        let mut map = ClassMap::new(w as u32, h as u32);
        for y in 0..h {
            for xx in 0..w {
                let scores = x.slice(ndarray::s![.., y, xx]);
                let (id, _) = scores
                    .iter()
                    .enumerate()
                    .fold((0usize, f32::NEG_INFINITY), |best, (c, &v)| {
                        if v > best.1 {
                            (c, v)
                        } else {
                            best
                        }
                    });
                map.put_pixel(xx as u32, y as u32, Luma([id as u16]));
            }
        }
        map
    }

    fn ids_to_map(ids: ArrayView2<f32>) -> ClassMap {
        let (h, w) = ids.dim();
        ClassMap::from_fn(w as u32, h as u32, |x, y| {
            Luma([ids[[y as usize, x as usize]].max(0.0).round() as u16])
        })
    }

    /// 最近邻缩放 (类别 id 不可插值)
    pub fn resize_nearest(map: &ClassMap, width: u32, height: u32) -> ClassMap {
        let (src_w, src_h) = map.dimensions();
        if (src_w, src_h) == (width, height) {
            return map.clone();
        }
        if src_w == 0 || src_h == 0 {
            return ClassMap::new(width, height);
        }
        let scale_w = src_w as f32 / width as f32;
        let scale_h = src_h as f32 / height as f32;
        ClassMap::from_fn(width, height, |x, y| {
            let sx = (((x as f32 + 0.5) * scale_w) as u32).min(src_w - 1);
            let sy = (((y as f32 + 0.5) * scale_h) as u32).min(src_h - 1);
            *map.get_pixel(sx, sy)
        })
    }

    /// 可行驶类别 → 255, 其余 → 0
    pub fn drivable_mask(map: &ClassMap, drivable_idx: &[u32]) -> GrayImage {
        GrayImage::from_fn(map.width(), map.height(), |x, y| {
            let id = map.get_pixel(x, y).0[0] as u32;
            if drivable_idx.contains(&id) {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    pub fn colorize(map: &ClassMap) -> RgbImage {
        RgbImage::from_fn(map.width(), map.height(), |x, y| {
            Rgb(class_color(map.get_pixel(x, y).0[0] as usize))
        })
    }
}

/// Cityscapes 调色板, 超出部分按 HSV 生成
pub fn class_color(id: usize) -> [u8; 3] {
    const CITYSCAPES: [[u8; 3]; 19] = [
        [128, 64, 128],  // road
        [244, 35, 232],  // sidewalk
        [70, 70, 70],    // building
        [102, 102, 156], // wall
        [190, 153, 153], // fence
        [153, 153, 153], // pole
        [250, 170, 30],  // traffic light
        [220, 220, 0],   // traffic sign
        [107, 142, 35],  // vegetation
        [152, 251, 152], // terrain
        [70, 130, 180],  // sky
        [220, 20, 60],   // person
        [255, 0, 0],     // rider
        [0, 0, 142],     // car
        [0, 0, 70],      // truck
        [0, 60, 100],    // bus
        [0, 80, 100],    // train
        [0, 0, 230],     // motorcycle
        [119, 11, 32],   // bicycle
    ];
    if let Some(c) = CITYSCAPES.get(id) {
        return *c;
    }
    let hue = ((id * 47) % 360) as f32;
    hsv_to_rgb(hue, 0.8, 0.8)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [u8; 3] {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;

    let (r, g, b) = if h < 60.0 {
        (c, x, 0.0)
    } else if h < 120.0 {
        (x, c, 0.0)
    } else if h < 180.0 {
        (0.0, c, x)
    } else if h < 240.0 {
        (0.0, x, c)
    } else if h < 300.0 {
        (x, 0.0, c)
    } else {
        (c, 0.0, x)
    };

    [
        ((r + m) * 255.0) as u8,
        ((g + m) * 255.0) as u8,
        ((b + m) * 255.0) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argmax_nchw() {
        // 3 类, 2x2
        let mut x = Array::zeros((1, 3, 2, 2)).into_dyn();
        x[[0, 0, 0, 0]] = 5.0;
        x[[0, 1, 0, 1]] = 5.0;
        x[[0, 2, 1, 0]] = 5.0;
        x[[0, 1, 1, 1]] = -1.0;
        let map = SegmentationPostprocessor.class_map(&x).unwrap();
        assert_eq!(map.dimensions(), (2, 2));
        assert_eq!(map.get_pixel(0, 0).0[0], 0);
        assert_eq!(map.get_pixel(1, 0).0[0], 1);
        assert_eq!(map.get_pixel(0, 1).0[0], 2);
        // 全 0 与 -1 → 第一个最大值 (类别 0)
        assert_eq!(map.get_pixel(1, 1).0[0], 0);
    }

    #[test]
    fn test_class_id_output() {
        let x = Array::from_shape_vec((1, 1, 3), vec![0.0, 7.0, 13.0])
            .unwrap()
            .into_dyn();
        let map = SegmentationPostprocessor.class_map(&x).unwrap();
        assert_eq!(map.dimensions(), (3, 1));
        assert_eq!(map.get_pixel(2, 0).0[0], 13);

        let bad = Array::<f32, _>::zeros((1, 1, 1, 1, 1)).into_dyn();
        assert!(SegmentationPostprocessor.class_map(&bad).is_err());
    }

    #[test]
    fn test_resize_and_drivable_mask() {
        let mut map = ClassMap::new(2, 2);
        map.put_pixel(0, 0, Luma([0]));
        map.put_pixel(1, 0, Luma([1]));
        map.put_pixel(0, 1, Luma([2]));
        map.put_pixel(1, 1, Luma([11]));
        let big = SegmentationPostprocessor::resize_nearest(&map, 4, 4);
        assert_eq!(big.dimensions(), (4, 4));
        assert_eq!(big.get_pixel(3, 0).0[0], 1);
        assert_eq!(big.get_pixel(3, 3).0[0], 11);

        let mask = SegmentationPostprocessor::drivable_mask(&big, &[0, 1]);
        assert_eq!(mask.get_pixel(0, 0).0[0], 255);
        assert_eq!(mask.get_pixel(3, 1).0[0], 255);
        assert_eq!(mask.get_pixel(0, 3).0[0], 0);
        assert_eq!(mask.get_pixel(3, 3).0[0], 0);
    }

    #[test]
    fn test_colorize() {
        let mut map = ClassMap::new(2, 1);
        map.put_pixel(1, 0, Luma([11]));
        let rgb = SegmentationPostprocessor::colorize(&map);
        assert_eq!(rgb.get_pixel(0, 0).0, [128, 64, 128]);
        assert_eq!(rgb.get_pixel(1, 0).0, [220, 20, 60]);
        assert_ne!(class_color(40), [0, 0, 0]);
    }

    #[test]
    fn test_preprocess_channel_order() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([255, 0, 0])));
        let mut pre = SegmentationPreprocess::for_arch(SegmentationArch::FCHarDNet);
        pre.width = 2;
        pre.height = 2;
        let x = pre.apply(std::slice::from_ref(&img));
        assert_eq!(x.shape(), &[1, 3, 2, 2]);
        // BGR: 红色落在第 2 通道
        assert!((x[[0, 2, 0, 0]] - (1.0 - 0.485) / 0.229).abs() < 0.05);
        assert!((x[[0, 0, 0, 0]] - (0.0 - 0.406) / 0.225).abs() < 0.05);

        let pre = pre.with_overrides(&SegmentationOverrides {
            channel_order: Some(ChannelOrder::Rgb),
            ..Default::default()
        });
        let x = pre.apply(std::slice::from_ref(&img));
        assert!((x[[0, 0, 1, 1]] - (1.0 - 0.406) / 0.225).abs() < 0.05);
    }

    #[test]
    fn test_class_maps_batch() {
        let mut x = Array::zeros((2, 2, 1, 2)).into_dyn();
        x[[0, 1, 0, 0]] = 1.0;
        x[[1, 1, 0, 1]] = 1.0;
        let maps = SegmentationPostprocessor.class_maps(&x).unwrap();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0].get_pixel(0, 0).0[0], 1);
        assert_eq!(maps[0].get_pixel(1, 0).0[0], 0);
        assert_eq!(maps[1].get_pixel(0, 0).0[0], 0);
        assert_eq!(maps[1].get_pixel(1, 0).0[0], 1);
    }

    #[test]
    fn test_zero_sized_output_is_rejected() {
        let post = SegmentationPostprocessor;
        for shape in [vec![1, 19, 0, 8], vec![1, 19, 8, 0], vec![1, 0, 8], vec![0, 8]] {
            let x = Array::<f32, _>::zeros(IxDyn(&shape));
            assert!(post.class_map(&x).is_err(), "{:?}", shape);
        }
        let empty = ClassMap::new(0, 0);
        let big = SegmentationPostprocessor::resize_nearest(&empty, 3, 2);
        assert_eq!(big.dimensions(), (3, 2));
        assert!(big.pixels().all(|p| p.0[0] == 0));
    }
}
