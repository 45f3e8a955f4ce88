// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 鸟瞰可行驶区域感知 - 直接运行: cargo run --release --bin birdview -- --source images/

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use birdview_rs::pipeline::{spawn_loader, FrameSource, OutputWriter};
use birdview_rs::render::load_font;
use birdview_rs::{gen_time_string, Args, PerceptionConfig, PerceptionSystem};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.init_config {
        PerceptionConfig::default().save(&args.config)?;
        return Ok(());
    }
    if args.source.is_empty() {
        bail!("请通过 --source 指定输入图片或目录");
    }

    let mut config = PerceptionConfig::load(&args.config)?;
    args.apply_overrides(&mut config);
    config.print_summary();

    let font = match &config.font_path {
        Some(p) => match load_font(p) {
            Ok(f) => Some(f),
            Err(e) => {
                log::warn!("⚠️  字体加载失败, 检测图不带标签: {:#}", e);
                None
            }
        },
        None => None,
    };

    let out_dir = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from("runs").join(gen_time_string("-")));
    let writer = OutputWriter::new(&out_dir, config.clone())?.with_font(font);

    let mut system = PerceptionSystem::new(config)?;

    let source = FrameSource::from_path(&args.source)?;
    let total = source.len();
    log::info!("📦 {} 张图片 → {}", total, out_dir.display());
    let (rx, loader) = spawn_loader(source, 4);

    let mut processed = 0usize;
    let mut failed = 0usize;
    let mut write_failed = 0usize;
    let mut busy = Duration::ZERO;
    let t_all = Instant::now();
    for frame in rx.iter() {
        let t = Instant::now();
        let output = match system.process_frame(&frame.image) {
            Ok(o) => o,
            Err(e) => {
                log::error!("❌ 处理失败 {}: {:#}", frame.path.display(), e);
                failed += 1;
                continue;
            }
        };
        let elapsed = t.elapsed();
        busy += elapsed;
        processed += 1;
        if let Err(e) = writer.write(&frame, &output, !args.no_overlay) {
            log::error!("❌ 写出失败 {}: {:#}", frame.path.display(), e);
            write_failed += 1;
            continue;
        }
        log::info!(
            "[{}/{}] {} | {} dets | {:?}",
            processed + failed,
            total,
            frame.stem(),
            output.detections.len(),
            elapsed
        );
    }
    if loader.join().is_err() {
        log::error!("❌ Loader 线程异常退出");
    }

    let avg = if processed > 0 {
        busy / processed as u32
    } else {
        Duration::ZERO
    };
    log::info!(
        "✅ 完成: {} 帧成功, {} 帧失败, {} 帧写出失败, 总耗时 {:?}, 平均每帧 {:?}",
        processed - write_failed,
        failed,
        write_failed,
        t_all.elapsed(),
        avg
    );
    Ok(())
}
