// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 鸟瞰图 (Bird's-eye view)
// - 可行驶区域: 阈值 → 连通域 → 取机器人所在区域 → 轮廓
// - 障碍物: 检测框接地点投影到鸟瞰图, 按类别画占位矩形

use image::{GrayImage, Luma};
use imageproc::contours::find_contours;
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use imageproc::region_labelling::{connected_components, Connectivity};

use crate::config::{DrivableConfig, ObstacleConfig};
use crate::{Bbox, PerspectiveMatrix};

/// 机器人在鸟瞰图中的位置: 相机画面底边中点 (w/2, h) 经 M 投影
pub fn robot_center(m: &PerspectiveMatrix, width: u32, height: u32) -> Option<(f64, f64)> {
    m.transform_point(width as f64 / 2.0, height as f64)
}

/// 提取机器人所在的可行驶区域轮廓
///
/// 返回与 `warped` 同尺寸的掩码: 轮廓为 `edge_value`, 区域内部为 `fill_value` (可选), 其余为 0
pub fn drivable_contour_mask(
    warped: &GrayImage,
    center: Option<(f64, f64)>,
    cfg: &DrivableConfig,
) -> GrayImage {
    let (w, h) = warped.dimensions();
    let mut out = GrayImage::new(w, h);
    if w == 0 || h == 0 {
        return out;
    }

    let binary = GrayImage::from_fn(w, h, |x, y| {
        if warped.get_pixel(x, y).0[0] > cfg.threshold {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    });
    let labels = connected_components(&binary, Connectivity::Eight, Luma([0u8]));

    // 中心点通常在鸟瞰图下边界之外, 夹到图内
    let (cx, cy) = match center {
        Some((x, y)) if x.is_finite() && y.is_finite() => (x, y),
        _ => (w as f64 / 2.0, h as f64),
    };
    let sx = (cx.round().clamp(0.0, (w - 1) as f64)) as u32;
    let sy = (cy.round().clamp(0.0, (h - 1) as f64)) as u32;

    let Some(label) = seed_label(&labels, sx, sy, cfg.seed_search_radius) else {
        log::warn!(
            "⚠️  机器人位置 ({:.1}, {:.1}) 附近 {} 像素内没有可行驶区域",
            cx,
            cy,
            cfg.seed_search_radius
        );
        return out;
    };

    // 四周补一圈背景, 贴边的区域也能找到闭合轮廓
    let component = GrayImage::from_fn(w + 2, h + 2, |x, y| {
        let inside = x >= 1 && y >= 1 && x <= w && y <= h;
        if inside && labels.get_pixel(x - 1, y - 1).0[0] == label {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    });
    let area = component.pixels().filter(|p| p.0[0] > 0).count();
    if (area as u64) < cfg.min_area as u64 {
        log::warn!(
            "⚠️  可行驶区域面积 {} 小于最小面积 {}",
            area,
            cfg.min_area
        );
        return out;
    }

    if let Some(fill) = cfg.fill_value {
        for (x, y, p) in component.enumerate_pixels() {
            if p.0[0] > 0 {
                out.put_pixel(x - 1, y - 1, Luma([fill]));
            }
        }
    }

    // 外轮廓 + 孔洞轮廓
    for contour in find_contours::<i32>(&component) {
        for p in contour.points {
            let (x, y) = (p.x - 1, p.y - 1);
            if x >= 0 && y >= 0 && (x as u32) < w && (y as u32) < h {
                out.put_pixel(x as u32, y as u32, Luma([cfg.edge_value]));
            }
        }
    }

    out
}

/// 种子所在连通域; 种子是背景时取半径内最近的前景像素
fn seed_label(
    labels: &image::ImageBuffer<Luma<u32>, Vec<u32>>,
    sx: u32,
    sy: u32,
    radius: u32,
) -> Option<u32> {
    let label = labels.get_pixel(sx, sy).0[0];
    if label != 0 {
        return Some(label);
    }

    let (w, h) = labels.dimensions();
    let r = radius as i64;
    let mut best: Option<(i64, u32)> = None;
    for dy in -r..=r {
        let y = sy as i64 + dy;
        if y < 0 || y >= h as i64 {
            continue;
        }
        for dx in -r..=r {
            let x = sx as i64 + dx;
            if x < 0 || x >= w as i64 {
                continue;
            }
            let d2 = dx * dx + dy * dy;
            if d2 > r * r {
                continue;
            }
            let l = labels.get_pixel(x as u32, y as u32).0[0];
            if l != 0 && best.map_or(true, |(bd, _)| d2 < bd) {
                best = Some((d2, l));
            }
        }
    }
    best.map(|(_, l)| l)
}

/// 将检测结果画到鸟瞰掩码上, 返回落在掩码内的障碍物数量
///
/// * `rates` - (w_rate, h_rate), 检测坐标 → 分割原始尺寸的缩放比例
pub fn rasterize_detections(
    mask: &mut GrayImage,
    detections: &[Bbox],
    m: &PerspectiveMatrix,
    rates: (f64, f64),
    conf_thres: f32,
    obstacles: &ObstacleConfig,
) -> usize {
    let (w_rate, h_rate) = rates;
    let mut drawn = 0;
    if mask.width() == 0 || mask.height() == 0 {
        return drawn;
    }
    for det in detections {
        if det.confidence() <= conf_thres {
            continue;
        }
        let ground = det.ground_point();
        let x = w_rate * ground.x() as f64;
        let y = h_rate * ground.y() as f64;
        let Some((u, v)) = m.transform_point(x, y) else {
            log::debug!("detection {:?} projects to infinity, skipped", det);
            continue;
        };

        let style = obstacles.style_for(det.id());
        if style.width == 0 || style.height == 0 {
            continue;
        }

        // 截断到整数像素; 矩形为 x ∈ [px - half, px + half], y ∈ [py - height, py]
        let (px, py) = (u.trunc(), v.trunc());
        let half = (style.width / 2) as f64;
        let height = style.height as f64;
        let (mw, mh) = (mask.width() as f64, mask.height() as f64);
        // 完全在掩码外 (含地平线附近投影出的极远点)
        if px + half < 0.0 || px - half >= mw || py < 0.0 || py - height >= mh {
            log::debug!("detection {:?} lands outside birdview at ({:.1}, {:.1})", det, u, v);
            continue;
        }
        // 在浮点中裁剪到掩码内, 再转为像素坐标
        let x0 = (px - half).max(0.0) as i32;
        let x1 = (px + half).min(mw - 1.0) as i32;
        let y0 = (py - height).max(0.0) as i32;
        let y1 = py.min(mh - 1.0) as i32;
        let rect = Rect::at(x0, y0).of_size((x1 - x0 + 1) as u32, (y1 - y0 + 1) as u32);
        draw_filled_rect_mut(mask, rect, Luma([style.value]));
        drawn += 1;
    }
    drawn
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObstacleStyle;

    fn two_regions() -> GrayImage {
        // 区域 A: x 5..15, y 10..20 (底部, 机器人所在); 区域 B: x 0..3, y 0..3
        GrayImage::from_fn(20, 20, |x, y| {
            let a = (5..15).contains(&x) && (10..20).contains(&y);
            let b = x < 3 && y < 3;
            if a || b {
                Luma([200])
            } else {
                Luma([30])
            }
        })
    }

    #[test]
    fn test_robot_center() {
        let m = PerspectiveMatrix::identity();
        assert_eq!(robot_center(&m, 640, 480), Some((320.0, 480.0)));
    }

    #[test]
    fn test_keeps_component_under_robot() {
        let cfg = DrivableConfig::default();
        let out = drivable_contour_mask(&two_regions(), Some((10.0, 25.0)), &cfg);
        assert_eq!(out.dimensions(), (20, 20));
        // 区域 A 的边界
        assert_eq!(out.get_pixel(5, 15).0[0], 254);
        assert_eq!(out.get_pixel(14, 19).0[0], 254);
        assert_eq!(out.get_pixel(10, 10).0[0], 254);
        // 内部不填充
        assert_eq!(out.get_pixel(10, 15).0[0], 0);
        // 区域 B 被丢弃
        assert_eq!(out.get_pixel(1, 1).0[0], 0);
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
    }

    #[test]
    fn test_fill_value() {
        let cfg = DrivableConfig {
            fill_value: Some(100),
            ..Default::default()
        };
        let out = drivable_contour_mask(&two_regions(), Some((10.0, 25.0)), &cfg);
        assert_eq!(out.get_pixel(10, 15).0[0], 100);
        assert_eq!(out.get_pixel(5, 15).0[0], 254);
        assert_eq!(out.get_pixel(4, 15).0[0], 0);
    }

    #[test]
    fn test_seed_search_radius() {
        let cfg = DrivableConfig::default();
        // (2, 19) 是背景, 最近的可行驶像素 (5, 19) 在半径内
        let out = drivable_contour_mask(&two_regions(), Some((2.0, 25.0)), &cfg);
        assert_eq!(out.get_pixel(5, 19).0[0], 254);

        let cfg = DrivableConfig {
            seed_search_radius: 2,
            ..Default::default()
        };
        let out = drivable_contour_mask(&two_regions(), Some((2.0, 25.0)), &cfg);
        assert!(out.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn test_min_area_and_missing_center() {
        let cfg = DrivableConfig {
            min_area: 1000,
            ..Default::default()
        };
        let out = drivable_contour_mask(&two_regions(), Some((10.0, 25.0)), &cfg);
        assert!(out.pixels().all(|p| p.0[0] == 0));

        // 无中心点 → 使用底边中点
        let out = drivable_contour_mask(&two_regions(), None, &DrivableConfig::default());
        assert_eq!(out.get_pixel(5, 15).0[0], 254);
    }

    #[test]
    fn test_rasterize_person_and_obstacle() {
        let mut mask = GrayImage::new(100, 100);
        let dets = vec![
            // person, 接地点 (30, 40)
            Bbox::from_xyxy(20.0, 10.0, 40.0, 40.0, 0, 0.9),
            // car, 接地点 (80, 95)
            Bbox::from_xyxy(70.0, 60.0, 90.0, 95.0, 2, 0.8),
        ];
        let n = rasterize_detections(
            &mut mask,
            &dets,
            &PerspectiveMatrix::identity(),
            (1.0, 1.0),
            0.25,
            &ObstacleConfig::default(),
        );
        assert_eq!(n, 2);
        // person: x 10..=50, y -20..=40 (裁剪到 0)
        assert_eq!(mask.get_pixel(10, 40).0[0], 253);
        assert_eq!(mask.get_pixel(50, 0).0[0], 253);
        assert_eq!(mask.get_pixel(9, 20).0[0], 0);
        assert_eq!(mask.get_pixel(30, 41).0[0], 0);
        // 其他: x 65..=95, y 5..=95
        assert_eq!(mask.get_pixel(65, 5).0[0], 255);
        assert_eq!(mask.get_pixel(95, 95).0[0], 255);
        assert_eq!(mask.get_pixel(64, 50).0[0], 0);
        assert_eq!(mask.get_pixel(80, 96).0[0], 0);
        assert_eq!(mask.get_pixel(80, 4).0[0], 0);
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut mask = GrayImage::new(50, 50);
        let dets = vec![Bbox::from_xyxy(20.0, 10.0, 30.0, 40.0, 0, 0.25)];
        let n = rasterize_detections(
            &mut mask,
            &dets,
            &PerspectiveMatrix::identity(),
            (1.0, 1.0),
            0.25,
            &ObstacleConfig::default(),
        );
        assert_eq!(n, 0);
        assert!(mask.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn test_rates_and_projection() {
        let mut mask = GrayImage::new(100, 100);
        // 帧坐标 (100, 100) → 原始尺寸 (50, 50) → 平移 (+10, 0)
        let dets = vec![Bbox::from_xyxy(90.0, 60.0, 110.0, 100.0, 5, 0.7)];
        let m = PerspectiveMatrix::from_array([[1.0, 0.0, 10.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        let obstacles = ObstacleConfig {
            other: ObstacleStyle {
                width: 2,
                height: 2,
                value: 99,
            },
            ..Default::default()
        };
        rasterize_detections(&mut mask, &dets, &m, (0.5, 0.5), 0.25, &obstacles);
        // x 59..=61, y 48..=50
        assert_eq!(mask.get_pixel(60, 50).0[0], 99);
        assert_eq!(mask.get_pixel(59, 48).0[0], 99);
        assert_eq!(mask.get_pixel(61, 50).0[0], 99);
        assert_eq!(mask.get_pixel(62, 50).0[0], 0);
        assert_eq!(mask.get_pixel(60, 51).0[0], 0);
        assert_eq!(mask.pixels().filter(|p| p.0[0] == 99).count(), 9);
    }

    #[test]
    fn test_projection_to_infinity_is_skipped() {
        let mut mask = GrayImage::new(20, 20);
        // w = y - 10, 接地点 y = 10 → 无穷远
        let m = PerspectiveMatrix::from_array([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 1.0, -10.0]]);
        let dets = vec![Bbox::from_xyxy(0.0, 0.0, 10.0, 10.0, 0, 0.9)];
        let n = rasterize_detections(
            &mut mask,
            &dets,
            &m,
            (1.0, 1.0),
            0.25,
            &ObstacleConfig::default(),
        );
        assert_eq!(n, 0);
    }

    #[test]
    fn test_off_image_rect_is_clipped() {
        let mut mask = GrayImage::new(20, 20);
        let dets = vec![Bbox::from_xyxy(-500.0, -500.0, -400.0, -400.0, 0, 0.9)];
        rasterize_detections(
            &mut mask,
            &dets,
            &PerspectiveMatrix::identity(),
            (1.0, 1.0),
            0.25,
            &ObstacleConfig::default(),
        );
        assert!(mask.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn test_projection_near_horizon_is_skipped() {
        // w = 1e-9 附近, 投影坐标约 1e12
        let m = PerspectiveMatrix::from_array([
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, -1.0, 100.000000001],
        ]);
        let mut mask = GrayImage::new(100, 100);
        // person, 接地点 (-1000, 100)
        let dets = vec![
            Bbox::from_xyxy(-1020.0, 40.0, -980.0, 100.0, 0, 0.9),
            Bbox::from_xyxy(980.0, 40.0, 1020.0, 100.0, 2, 0.9),
        ];
        let n = rasterize_detections(
            &mut mask,
            &dets,
            &m,
            (1.0, 1.0),
            0.25,
            &ObstacleConfig::default(),
        );
        assert_eq!(n, 0);
        assert!(mask.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn test_huge_obstacle_style() {
        let mut mask = GrayImage::new(10, 10);
        let obstacles = ObstacleConfig {
            other: ObstacleStyle {
                width: u32::MAX,
                height: u32::MAX,
                value: 7,
            },
            ..Default::default()
        };
        let dets = vec![Bbox::from_xyxy(4.0, 0.0, 6.0, 5.0, 3, 0.9)];
        let n = rasterize_detections(
            &mut mask,
            &dets,
            &PerspectiveMatrix::identity(),
            (1.0, 1.0),
            0.25,
            &obstacles,
        );
        // 裁剪后覆盖整个掩码
        assert_eq!(n, 1);
        assert!(mask.pixels().all(|p| p.0[0] == 7));
    }
}
