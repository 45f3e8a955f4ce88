/// 帧处理流水线 (Frame Pipeline)
///
/// 两线程架构, 通过 crossbeam 有界通道通信:
/// - Loader:     图片读取解码 (独立线程)
/// - Perception: 分割 + 检测 + 鸟瞰图 (主线程), 结果交给 OutputWriter 落盘
pub mod source;
pub mod writer;

pub use source::{spawn_loader, FrameSource};
pub use writer::{DetectionRecord, FrameReport, OutputWriter};

use image::DynamicImage;
use std::path::PathBuf;

/// 解码帧 (Loader → Perception)
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: DynamicImage,
    pub path: PathBuf,
    pub frame_id: u64, // 帧序号
}

impl Frame {
    /// 输出文件名前缀
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("frame_{:06}", self.frame_id))
    }
}
