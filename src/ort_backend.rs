// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// ONNX Runtime 推理后端
// 负责: 会话构建、执行提供者选择、张量输入输出转换

use anyhow::{bail, Context, Result};
use ndarray::{Array, IxDyn};
use ort::execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};

/// 执行提供者 (Execution Provider)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrtEP {
    CPU,
    CUDA(i32),
    Trt(i32),
}

#[derive(Debug, Clone)]
pub struct OrtConfig {
    pub f: PathBuf,
    pub ep: OrtEP,
    pub trt_fp16: bool,
    pub intra_threads: Option<usize>,
}

impl OrtConfig {
    pub fn new<P: AsRef<Path>>(f: P, ep: OrtEP) -> Self {
        Self {
            f: f.as_ref().to_path_buf(),
            ep,
            trt_fp16: false,
            intra_threads: None,
        }
    }
}

pub struct OrtBackend {
    session: Session,
    path: PathBuf,
    ep: OrtEP,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl OrtBackend {
    pub fn build(config: OrtConfig) -> Result<Self> {
        if !config.f.exists() {
            bail!("Model file not found: {}", config.f.display());
        }

        let mut builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?;

        if let Some(n) = config.intra_threads {
            builder = builder.with_intra_threads(n)?;
        }

        // 注册失败时 ort 会回退到 CPU
        builder = match config.ep {
            OrtEP::CPU => builder,
            OrtEP::CUDA(device_id) => builder.with_execution_providers([
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])?,
            OrtEP::Trt(device_id) => builder.with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .with_fp16(config.trt_fp16)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])?,
        };

        let session = builder
            .commit_from_file(&config.f)
            .with_context(|| format!("Failed to load ONNX model {}", config.f.display()))?;

        let inputs = session.inputs.iter().map(|i| i.name.to_string()).collect();
        let outputs = session.outputs.iter().map(|o| o.name.to_string()).collect();

        Ok(Self {
            session,
            path: config.f,
            ep: config.ep,
            inputs,
            outputs,
        })
    }

    /// 单输入推理, 返回全部输出 (拷贝为 owned 数组)
    pub fn run(&mut self, xs: Array<f32, IxDyn>, profile: bool) -> Result<Vec<Array<f32, IxDyn>>> {
        let t = std::time::Instant::now();
        let input = Tensor::from_array(xs)?;
        let outputs = self.session.run(ort::inputs![input])?;

        let mut ys = Vec::with_capacity(self.outputs.len());
        for name in self.outputs.iter() {
            let y = outputs[name.as_str()]
                .try_extract_array::<f32>()
                .with_context(|| format!("Failed to extract output `{}`", name))?;
            ys.push(y.to_owned());
        }
        if profile {
            log::info!("[ORT Inference]: {:?}", t.elapsed());
        }
        Ok(ys)
    }

    pub fn ep(&self) -> &OrtEP {
        &self.ep
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }
}
