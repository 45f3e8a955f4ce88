// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 透视标定: 相机画面中地面点 → 鸟瞰图点
//
//   cargo run --bin birdview_calib -- \
//     --src 200,300 --src 440,300 --src 640,480 --src 0,480 \
//     --dst 140,0 --dst 340,0 --dst 340,480 --dst 140,480

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use birdview_rs::utils::perspective::{calibrate, reprojection_errors};

/// 透视标定
#[derive(Parser, Debug)]
#[command(author, version, about = "由点对计算鸟瞰透视矩阵 M / M_inv", long_about = None)]
struct CalibArgs {
    /// 相机画面中的点 "x,y" (至少4个)
    #[arg(long = "src", value_parser = parse_point, required = true)]
    src: Vec<(f64, f64)>,

    /// 对应的鸟瞰图点 "x,y"
    #[arg(long = "dst", value_parser = parse_point, required = true)]
    dst: Vec<(f64, f64)>,

    /// 鸟瞰图宽度
    #[arg(long, default_value_t = 480)]
    width: u32,

    /// 鸟瞰图高度
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// 输出JSON
    #[arg(short, long, default_value = "perspective_transform.json")]
    output: PathBuf,
}

fn parse_point(s: &str) -> Result<(f64, f64), String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected \"x,y\", got {:?}", s))?;
    let x = x.trim().parse::<f64>().map_err(|e| format!("{}: {}", x, e))?;
    let y = y.trim().parse::<f64>().map_err(|e| format!("{}: {}", y, e))?;
    Ok((x, y))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = CalibArgs::parse();

    for &(u, v) in &args.dst {
        if u < 0.0 || v < 0.0 || u > args.width as f64 || v > args.height as f64 {
            log::warn!(
                "⚠️  目标点 ({}, {}) 在鸟瞰图 {}x{} 之外",
                u,
                v,
                args.width,
                args.height
            );
        }
    }

    let transforms = calibrate(&args.src, &args.dst)?;
    transforms.save(&args.output)?;

    println!("M = {:?}", transforms.m.to_array());
    println!("M_inv = {:?}", transforms.m_inv.to_array());
    for (i, err) in reprojection_errors(&transforms.m, &args.src, &args.dst)
        .iter()
        .enumerate()
    {
        println!(
            "  #{} {:?} → {:?}: 重投影误差 {:.4} px",
            i, args.src[i], args.dst[i], err
        );
    }
    println!("💾 已保存到 {}", args.output.display());
    Ok(())
}
