/// 透视变换工具模块 (矩阵运算基于 nalgebra)
/// 实现类似于 cv2::getPerspectiveTransform / cv2::perspectiveTransform / cv2::warpPerspective 的功能
use anyhow::{bail, Context, Result};
use image::{GrayImage, Luma};
use nalgebra::{DMatrix, Matrix3, SMatrix, SVector};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 透视变换矩阵 (3x3, 行主序)
/// | h00 h01 h02 |
/// | h10 h11 h12 |
/// | h20 h21 h22 |
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[[f64; 3]; 3]", into = "[[f64; 3]; 3]")]
pub struct PerspectiveMatrix {
    pub h: [[f64; 3]; 3],
}

impl From<[[f64; 3]; 3]> for PerspectiveMatrix {
    fn from(h: [[f64; 3]; 3]) -> Self {
        Self { h }
    }
}

impl From<PerspectiveMatrix> for [[f64; 3]; 3] {
    fn from(m: PerspectiveMatrix) -> Self {
        m.h
    }
}

impl PerspectiveMatrix {
    /// 创建单位矩阵
    pub fn identity() -> Self {
        Self {
            h: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }

    /// 从3x3数组创建
    pub fn from_array(h: [[f64; 3]; 3]) -> Self {
        Self { h }
    }

    /// 转换为3x3数组
    pub fn to_array(&self) -> [[f64; 3]; 3] {
        self.h
    }

    /// 应用透视变换到点 (x, y); 落到无穷远时返回 None
    pub fn transform_point(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let h = &self.h;
        let w = h[2][0] * x + h[2][1] * y + h[2][2];
        if w.abs() < f64::EPSILON {
            return None;
        }
        let u = (h[0][0] * x + h[0][1] * y + h[0][2]) / w;
        let v = (h[1][0] * x + h[1][1] * y + h[1][2]) / w;
        if u.is_finite() && v.is_finite() {
            Some((u, v))
        } else {
            None
        }
    }

    pub fn to_matrix3(&self) -> Matrix3<f64> {
        let h = &self.h;
        Matrix3::new(
            h[0][0], h[0][1], h[0][2], //
            h[1][0], h[1][1], h[1][2], //
            h[2][0], h[2][1], h[2][2],
        )
    }

    pub fn from_matrix3(m: &Matrix3<f64>) -> Self {
        Self {
            h: [
                [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
                [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
                [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
            ],
        }
    }

    pub fn determinant(&self) -> f64 {
        self.to_matrix3().determinant()
    }

    /// 逆矩阵 (h22 归一化); 奇异时返回 None
    pub fn inverse(&self) -> Option<Self> {
        if self.determinant().abs() < 1e-12 {
            return None;
        }
        let inv = Self::from_matrix3(&self.to_matrix3().try_inverse()?);
        inv.is_finite().then(|| inv.normalized())
    }

    /// 矩阵组合 (self * other): 先 other 后 self
    pub fn compose(&self, other: &Self) -> Self {
        Self::from_matrix3(&(self.to_matrix3() * other.to_matrix3()))
    }

    /// 归一化使 h22 = 1 (h22 接近 0 时保持不变)
    pub fn normalized(&self) -> Self {
        let s = self.h[2][2];
        if s.abs() < 1e-12 {
            return *self;
        }
        let mut h = self.h;
        for row in h.iter_mut() {
            for v in row.iter_mut() {
                *v /= s;
            }
        }
        Self { h }
    }

    pub fn is_finite(&self) -> bool {
        self.h.iter().flatten().all(|v| v.is_finite())
    }

    /// 与另一矩阵是否近似相等 (先归一化)
    pub fn approx_eq(&self, other: &Self, eps: f64) -> bool {
        let a = self.normalized();
        let b = other.normalized();
        a.h.iter()
            .flatten()
            .zip(b.h.iter().flatten())
            .all(|(x, y)| (x - y).abs() <= eps * (1.0 + x.abs().max(y.abs())))
    }
}

/// 插值方法
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InterpolationMethod {
    Nearest,  // 最近邻插值
    Bilinear, // 双线性插值
}

/// 边界处理方法
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BorderMode {
    Constant(u8), // 常数填充
    Replicate,    // 边缘复制
    Reflect,      // 反射
    Wrap,         // 环绕
}

/// 透视变换 (单通道灰度图)
///
/// # 参数
/// - `src`: 源图像
/// - `matrix`: 源 → 目标 的透视矩阵
/// - `dst_size`: 目标图像尺寸 (width, height)
/// - `interpolation`: 插值方法
/// - `border_mode`: 边界处理方法
pub fn warp_perspective_gray(
    src: &GrayImage,
    matrix: &PerspectiveMatrix,
    dst_size: (u32, u32),
    interpolation: InterpolationMethod,
    border_mode: BorderMode,
) -> Result<GrayImage> {
    let inv_matrix = matrix
        .inverse()
        .context("perspective matrix is not invertible")?;
    Ok(warp_perspective_gray_inv(
        src,
        &inv_matrix,
        dst_size,
        interpolation,
        border_mode,
    ))
}

/// 透视变换, 直接使用 目标 → 源 的逆矩阵做反向映射
pub fn warp_perspective_gray_inv(
    src: &GrayImage,
    inv_matrix: &PerspectiveMatrix,
    dst_size: (u32, u32),
    interpolation: InterpolationMethod,
    border_mode: BorderMode,
) -> GrayImage {
    let (dst_width, dst_height) = dst_size;
    let fill = match border_mode {
        BorderMode::Constant(val) => val,
        _ => 0,
    };
    let mut dst = GrayImage::from_pixel(dst_width, dst_height, Luma([fill]));
    if src.width() == 0 || src.height() == 0 {
        return dst;
    }

    for dst_y in 0..dst_height {
        for dst_x in 0..dst_width {
            let Some((src_x, src_y)) = inv_matrix.transform_point(dst_x as f64, dst_y as f64)
            else {
                continue;
            };

            let pixel_value = match interpolation {
                InterpolationMethod::Nearest => {
                    get_pixel_nearest(src, src_x as f32, src_y as f32, border_mode)
                }
                InterpolationMethod::Bilinear => {
                    get_pixel_bilinear(src, src_x as f32, src_y as f32, border_mode)
                }
            };

            dst.put_pixel(dst_x, dst_y, Luma([pixel_value]));
        }
    }

    dst
}

/// 最近邻插值
fn get_pixel_nearest(src: &GrayImage, x: f32, y: f32, border_mode: BorderMode) -> u8 {
    get_border_pixel(src, x.round() as i32, y.round() as i32, border_mode)
}

/// 双线性插值
fn get_pixel_bilinear(src: &GrayImage, x: f32, y: f32, border_mode: BorderMode) -> u8 {
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let x1 = x0 + 1;
    let y1 = y0 + 1;

    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = get_border_pixel(src, x0, y0, border_mode) as f32;
    let p01 = get_border_pixel(src, x0, y1, border_mode) as f32;
    let p10 = get_border_pixel(src, x1, y0, border_mode) as f32;
    let p11 = get_border_pixel(src, x1, y1, border_mode) as f32;

    let v0 = p00 * (1.0 - fx) + p10 * fx;
    let v1 = p01 * (1.0 - fx) + p11 * fx;
    let result = v0 * (1.0 - fy) + v1 * fy;

    result.round().clamp(0.0, 255.0) as u8
}

/// 边界处理
fn get_border_pixel(src: &GrayImage, x: i32, y: i32, border_mode: BorderMode) -> u8 {
    let (width, height) = (src.width() as i32, src.height() as i32);
    let (bx, by) = handle_border(x, y, width, height, border_mode);

    if bx >= 0 && bx < width && by >= 0 && by < height {
        src.get_pixel(bx as u32, by as u32).0[0]
    } else {
        match border_mode {
            BorderMode::Constant(val) => val,
            _ => 0,
        }
    }
}

/// 边界坐标处理
fn handle_border(x: i32, y: i32, width: i32, height: i32, border_mode: BorderMode) -> (i32, i32) {
    match border_mode {
        BorderMode::Constant(_) => (x, y),
        BorderMode::Replicate => (x.clamp(0, width - 1), y.clamp(0, height - 1)),
        BorderMode::Reflect => {
            let reflect = |v: i32, n: i32| {
                let v = if v < 0 {
                    -v - 1
                } else if v >= n {
                    2 * n - v - 1
                } else {
                    v
                };
                v.clamp(0, n - 1)
            };
            (reflect(x, width), reflect(y, height))
        }
        BorderMode::Wrap => (x.rem_euclid(width), y.rem_euclid(height)),
    }
}

/// 从4个对应点对获取透视变换矩阵 (h22 = 1, 归一化坐标下 LU 求解)
///
/// # 参数
/// - `src_pts`: 源图像中的4个点
/// - `dst_pts`: 目标图像中的4个点
pub fn get_perspective_transform(
    src_pts: [(f64, f64); 4],
    dst_pts: [(f64, f64); 4],
) -> Option<PerspectiveMatrix> {
    let (src_n, t_src) = normalize_points(&src_pts);
    let (dst_n, t_dst) = normalize_points(&dst_pts);

    // [x y 1 0 0 0 -x*u -y*u] h = u
    // [0 0 0 x y 1 -x*v -y*v] h = v
    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();
    for (k, (&(x, y), &(u, v))) in src_n.iter().zip(dst_n.iter()).enumerate() {
        let r0 = 2 * k;
        a[(r0, 0)] = x;
        a[(r0, 1)] = y;
        a[(r0, 2)] = 1.0;
        a[(r0, 6)] = -u * x;
        a[(r0, 7)] = -u * y;
        b[r0] = u;

        let r1 = 2 * k + 1;
        a[(r1, 3)] = x;
        a[(r1, 4)] = y;
        a[(r1, 5)] = 1.0;
        a[(r1, 6)] = -v * x;
        a[(r1, 7)] = -v * y;
        b[r1] = v;
    }

    // 共线等退化点集
    let sv = a.singular_values();
    if sv.min() <= sv.max() * RANK_EPS {
        return None;
    }
    let h = a.lu().solve(&b)?;
    let hn = Matrix3::new(
        h[0], h[1], h[2], //
        h[3], h[4], h[5], //
        h[6], h[7], 1.0,
    );
    denormalize(hn, &t_src, &t_dst)
}

/// 最小二乘估计透视矩阵 (N >= 4 个点对, Hartley 归一化 + SVD 求 Ah = 0)
pub fn find_homography(src_pts: &[(f64, f64)], dst_pts: &[(f64, f64)]) -> Option<PerspectiveMatrix> {
    if src_pts.len() != dst_pts.len() || src_pts.len() < 4 {
        return None;
    }
    let (src_n, t_src) = normalize_points(src_pts);
    let (dst_n, t_dst) = normalize_points(dst_pts);

    // 2N x 9, 不足 9 行时补零行, 保证 V^T 为 9x9
    let n = src_pts.len();
    let mut a = DMatrix::<f64>::zeros((2 * n).max(9), 9);
    for (k, (&(x, y), &(u, v))) in src_n.iter().zip(dst_n.iter()).enumerate() {
        // [ -x -y -1   0  0  0   u*x u*y u ]
        a[(2 * k, 0)] = -x;
        a[(2 * k, 1)] = -y;
        a[(2 * k, 2)] = -1.0;
        a[(2 * k, 6)] = u * x;
        a[(2 * k, 7)] = u * y;
        a[(2 * k, 8)] = u;

        // [ 0  0  0  -x -y -1   v*x v*y v ]
        a[(2 * k + 1, 3)] = -x;
        a[(2 * k + 1, 4)] = -y;
        a[(2 * k + 1, 5)] = -1.0;
        a[(2 * k + 1, 6)] = v * x;
        a[(2 * k + 1, 7)] = v * y;
        a[(2 * k + 1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let vt = svd.v_t?;
    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&i, &j| svd.singular_values[i].total_cmp(&svd.singular_values[j]));
    let (smallest, second) = (order[0], order[1]);
    let largest = order[order.len() - 1];
    // 零空间多于一维: 点集退化
    if svd.singular_values[second] <= svd.singular_values[largest] * RANK_EPS {
        return None;
    }

    let h = vt.row(smallest);
    let hn = Matrix3::new(
        h[0], h[1], h[2], //
        h[3], h[4], h[5], //
        h[6], h[7], h[8],
    );
    denormalize(hn, &t_src, &t_dst)
}

const RANK_EPS: f64 = 1e-10;

/// H = T_dst^-1 * Hn * T_src, h22 归一化
fn denormalize(hn: Matrix3<f64>, t_src: &Matrix3<f64>, t_dst: &Matrix3<f64>) -> Option<PerspectiveMatrix> {
    let t_dst_inv = (*t_dst).try_inverse()?;
    let m = PerspectiveMatrix::from_matrix3(&(t_dst_inv * hn * t_src)).normalized();
    m.is_finite().then_some(m)
}

/// 平移到质心, 缩放使平均距离为 sqrt(2)
fn normalize_points(pts: &[(f64, f64)]) -> (Vec<(f64, f64)>, Matrix3<f64>) {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p.0).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p.1).sum::<f64>() / n;
    let mean_dist = pts
        .iter()
        .map(|p| ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let out = pts.iter().map(|p| (s * (p.0 - cx), s * (p.1 - cy))).collect();
    (out, t)
}

/// 相机视角 → 鸟瞰视角的透视矩阵对
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerspectiveTransforms {
    /// 相机 → 鸟瞰
    pub m: PerspectiveMatrix,
    /// 鸟瞰 → 相机
    pub m_inv: PerspectiveMatrix,
}

#[derive(Serialize, Deserialize)]
struct TransformsFile {
    #[serde(rename = "M")]
    m: PerspectiveMatrix,
    #[serde(rename = "M_inv", default, skip_serializing_if = "Option::is_none")]
    m_inv: Option<PerspectiveMatrix>,
}

impl PerspectiveTransforms {
    pub fn new(m: PerspectiveMatrix) -> Result<Self> {
        if !m.is_finite() {
            bail!("perspective matrix contains non-finite values");
        }
        let Some(m_inv) = m.inverse() else {
            bail!("perspective matrix is singular");
        };
        Ok(Self { m, m_inv })
    }

    /// 校验 M * M_inv ≈ I
    pub fn with_inverse(m: PerspectiveMatrix, m_inv: PerspectiveMatrix) -> Result<Self> {
        Self::new(m)?;
        if !m.compose(&m_inv).approx_eq(&PerspectiveMatrix::identity(), 1e-4) {
            bail!("M_inv is not the inverse of M");
        }
        Ok(Self { m, m_inv })
    }

    /// 从JSON加载: {"M": [[..];3], "M_inv": [[..];3]}, M_inv 可省略
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("无法读取透视变换文件 {}", path.display()))?;
        let file: TransformsFile = serde_json::from_str(&json)
            .with_context(|| format!("透视变换文件解析失败 {}", path.display()))?;
        match file.m_inv {
            Some(m_inv) => Self::with_inverse(file.m, m_inv),
            None => Self::new(file.m),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = TransformsFile {
            m: self.m,
            m_inv: Some(self.m_inv),
        };
        fs::write(path, serde_json::to_string_pretty(&file)?)
            .with_context(|| format!("保存透视变换失败 {}", path.display()))?;
        Ok(())
    }
}

/// 由点对标定透视矩阵: 4 对用精确解, 更多用最小二乘
pub fn calibrate(src_pts: &[(f64, f64)], dst_pts: &[(f64, f64)]) -> Result<PerspectiveTransforms> {
    if src_pts.len() != dst_pts.len() {
        bail!(
            "point count mismatch: {} src vs {} dst",
            src_pts.len(),
            dst_pts.len()
        );
    }
    let m = match (<[(f64, f64); 4]>::try_from(src_pts), <[(f64, f64); 4]>::try_from(dst_pts)) {
        (Ok(src), Ok(dst)) => get_perspective_transform(src, dst),
        _ if src_pts.len() > 4 => find_homography(src_pts, dst_pts),
        _ => bail!("need at least 4 point pairs, got {}", src_pts.len()),
    };
    let Some(m) = m else {
        bail!("degenerate point configuration, no homography found");
    };
    PerspectiveTransforms::new(m.normalized())
}

/// 每个点对的重投影误差 (像素); 投影到无穷远时为 inf
pub fn reprojection_errors(
    m: &PerspectiveMatrix,
    src_pts: &[(f64, f64)],
    dst_pts: &[(f64, f64)],
) -> Vec<f64> {
    src_pts
        .iter()
        .zip(dst_pts)
        .map(|(&(x, y), &(u, v))| match m.transform_point(x, y) {
            Some((px, py)) => ((px - u).powi(2) + (py - v).powi(2)).sqrt(),
            None => f64::INFINITY,
        })
        .collect()
}
