//! 超体素批处理程序.
//!
//! ```text
//! sv-runner <batch.toml> [--output-dir DIR] [--workers N] [--log-level LEVEL]
//! ```

use std::process::ExitCode;

use clap::Parser;

mod batch;
mod progress;
mod result;
mod runner;

/// 命令行参数. 命令行优先于批处理文件中的同名设置.
#[derive(Debug, Parser)]
#[command(name = "sv-runner", version, about = "按批处理文件运行超体素 / PCA / 区域均值流程")]
pub struct Cli {
    /// 批处理文件 (TOML).
    pub batch: std::path::PathBuf,

    /// 输出目录. 默认为批处理文件所在目录下的 `output`.
    #[arg(short, long)]
    pub output_dir: Option<std::path::PathBuf>,

    /// worker 线程数. 默认为可并行核心数.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// 日志级别 (`error`, `warn`, `info`, `debug`, `trace`).
    #[arg(short, long)]
    pub log_level: Option<log::LevelFilter>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match runner::run(&cli) {
        Ok(result) => {
            result.analyze();
            if result.all_succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("sv-runner: {e}");
            ExitCode::FAILURE
        }
    }
}
