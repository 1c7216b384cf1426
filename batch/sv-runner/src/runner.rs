//! 程序运行函数.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::LevelFilter;
use perf_berry::process::{
    CurveNormaliseProcess, MeanValuesProcess, PcaProcess, ProcessError, SupervoxelProcess,
};
use perf_berry::task::WorkerPool;
use perf_berry::VolumeError;
use simple_logger::SimpleLogger;
use thiserror::Error;
use utils::loader;

use crate::batch::{BatchEntry, BatchFile, CurveNormaliseEntry, MeanValuesEntry, PcaEntry, SupervoxelEntry};
use crate::progress::ConsoleSink;
use crate::result::{BatchResult, EntryResult};
use crate::Cli;

/// 批处理错误.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// 文件读写失败.
    #[error("文件读写失败: {0}")]
    Io(#[from] io::Error),

    /// 批处理文件格式错误.
    #[error("批处理文件格式错误: {0}")]
    Toml(#[from] toml::de::Error),

    /// 日志初始化失败.
    #[error("日志初始化失败: {0}")]
    Logger(#[from] log::SetLoggerError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Volume(#[from] VolumeError),
}

/// 合并命令行与批处理文件之后的全局设置.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub output_dir: PathBuf,
    pub workers: usize,
    pub level: LevelFilter,
}

impl Settings {
    /// 命令行 > 批处理文件 > 默认值.
    ///
    /// `base` 为批处理文件所在目录, 文件中的相对输出目录基于它解析.
    pub fn resolve(cli: &Cli, batch: &BatchFile, base: &Path) -> Self {
        let output_dir = cli
            .output_dir
            .clone()
            .or_else(|| batch.output_dir.as_ref().map(|d| base.join(d)))
            .unwrap_or_else(|| base.join("output"));
        let workers = cli.workers.or(batch.workers).unwrap_or_else(utils::cpus).max(1);
        let level = cli.log_level.or_else(|| batch.log_level()).unwrap_or(LevelFilter::Info);
        Self { output_dir, workers, level }
    }
}

/// 实际运行.
pub fn run(cli: &Cli) -> Result<BatchResult, RunnerError> {
    let text = fs::read_to_string(&cli.batch)?;
    let batch: BatchFile = toml::from_str(&text)?;
    let base = cli.batch.parent().map(Path::to_path_buf).unwrap_or_default();
    let settings = Settings::resolve(cli, &batch, &base);

    SimpleLogger::new().with_level(settings.level).init()?;
    if batch.log_level.is_some() && batch.log_level().is_none() {
        log::warn!("无法识别的日志级别 {:?}, 使用 {}", batch.log_level, settings.level);
    }
    log::info!(
        "批处理 {}: {} 个条目, {} 个 worker, 输出到 {}",
        cli.batch.display(),
        batch.len(),
        settings.workers,
        settings.output_dir.display()
    );

    let pool = WorkerPool::new(settings.workers);
    let result = execute(&batch, &base, &settings.output_dir, &pool);
    pool.shutdown();
    Ok(result)
}

/// 按文件中的顺序依次执行全部条目. 单个条目失败不影响之后的条目.
///
/// 每个条目的输出写到 `output_dir/<output-name>/` 下.
pub fn execute(batch: &BatchFile, base: &Path, output_dir: &Path, pool: &WorkerPool) -> BatchResult {
    let mut result = BatchResult::default();
    for entry in &batch.process {
        let r = run_entry(entry.kind(), entry.output_name(), |r| match entry {
            BatchEntry::Supervoxels(e) => supervoxels(e, base, output_dir, pool, r),
            BatchEntry::Pca(e) => pca(e, base, output_dir, r),
            BatchEntry::MeanValues(e) => mean_values(e, base, output_dir, r),
            BatchEntry::CurveNormalise(e) => curve_normalise(e, base, output_dir, pool, r),
        });
        result.push(r);
    }
    result
}

fn run_entry<F>(kind: &'static str, name: &str, f: F) -> EntryResult
where
    F: FnOnce(&mut EntryResult) -> Result<(), RunnerError>,
{
    log::info!("开始 {kind} `{name}`");
    let mut r = EntryResult::new(kind, name);
    if let Err(e) = f(&mut r) {
        log::error!("{kind} `{name}` 失败: {e}");
        r.error = Some(e.to_string());
        r.files.clear();
    }
    r
}

/// 输入路径. 除了 [`loader::resolve_input`] 的搜索顺序, 还会在输出目录中查找,
/// 以便引用之前条目的输出.
fn input_path(path: &Path, base: &Path, output_dir: &Path) -> PathBuf {
    let p = loader::resolve_input(path, base);
    if p.exists() || path.is_absolute() {
        return p;
    }
    let o = output_dir.join(path);
    if o.exists() {
        o
    } else {
        p
    }
}

fn supervoxels(
    e: &SupervoxelEntry,
    base: &Path,
    output_dir: &Path,
    pool: &WorkerPool,
    r: &mut EntryResult,
) -> Result<(), RunnerError> {
    let name = &e.options.output_name;
    r.io.start();
    let volume = loader::open_volume(input_path(&e.data, base, output_dir))?;
    let roi = loader::open_roi(input_path(&e.roi, base, output_dir))?;
    r.io.elapsed();

    r.compute.start();
    let report = SupervoxelProcess::new(pool).run_sync_with(&volume, &roi, &e.options, ConsoleSink::new(name))?;
    r.compute.elapsed();
    r.summary = Some(format!(
        "{} supervoxels, {} deactivated, {} iterations, converged: {}",
        report.n_segments, report.deactivated, report.iterations, report.converged
    ));

    r.io.start();
    r.files = report.save_all(output_dir.join(name), name)?;
    r.io.elapsed();
    Ok(())
}

fn pca(e: &PcaEntry, base: &Path, output_dir: &Path, r: &mut EntryResult) -> Result<(), RunnerError> {
    let name = &e.options.output_name;
    r.io.start();
    let volume = loader::open_volume(input_path(&e.data, base, output_dir))?;
    let roi = match &e.roi {
        Some(p) => Some(loader::open_roi(input_path(p, base, output_dir))?),
        None => None,
    };
    r.io.elapsed();

    r.compute.start();
    let report = PcaProcess::run(&volume, roi.as_ref(), &e.options)?;
    r.compute.elapsed();
    let explained: Vec<String> = report.explained_variance.iter().map(|v| format!("{v:.4}")).collect();
    r.summary = Some(format!("explained variance: [{}]", explained.join(", ")));

    r.io.start();
    r.files = report.save_all(output_dir.join(name), name)?;
    r.io.elapsed();
    Ok(())
}

fn mean_values(e: &MeanValuesEntry, base: &Path, output_dir: &Path, r: &mut EntryResult) -> Result<(), RunnerError> {
    let name = &e.options.output_name;
    r.io.start();
    let volume = loader::open_volume(input_path(&e.data, base, output_dir))?;
    let labels = loader::open_labels(input_path(&e.labels, base, output_dir))?;
    r.io.elapsed();

    r.compute.start();
    let out = MeanValuesProcess::run(&volume, &labels)?;
    r.compute.elapsed();
    r.summary = Some(format!("{} regions", labels.regions().len()));

    r.io.start();
    let dir = output_dir.join(name);
    fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{name}.nii.gz"));
    out.save(&path)?;
    r.files.push(path);
    r.io.elapsed();
    Ok(())
}

fn curve_normalise(
    e: &CurveNormaliseEntry,
    base: &Path,
    output_dir: &Path,
    pool: &WorkerPool,
    r: &mut EntryResult,
) -> Result<(), RunnerError> {
    let name = &e.options.output_name;
    r.io.start();
    let volume = loader::open_volume(input_path(&e.data, base, output_dir))?;
    r.io.elapsed();

    r.compute.start();
    let out = CurveNormaliseProcess::new(pool).run_sync_with(&volume, &e.options, ConsoleSink::new(name))?;
    r.compute.elapsed();

    r.io.start();
    let dir = output_dir.join(name);
    fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{name}.nii.gz"));
    out.save(&path)?;
    r.files.push(path);
    r.io.elapsed();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};
    use perf_berry::{Grid, GridAttr, LabelVolume, PerfVolume};

    fn cli(batch: PathBuf) -> Cli {
        Cli { batch, output_dir: None, workers: None, log_level: None }
    }

    #[test]
    fn test_settings_precedence() {
        let batch: BatchFile = toml::from_str("output-dir = \"res\"\nworkers = 3\nlog-level = \"warn\"").unwrap();
        let base = Path::new("/data/study");

        let s = Settings::resolve(&cli(base.join("b.toml")), &batch, base);
        assert_eq!(s.output_dir, base.join("res"));
        assert_eq!(s.workers, 3);
        assert_eq!(s.level, LevelFilter::Warn);

        let mut c = cli(base.join("b.toml"));
        c.output_dir = Some(PathBuf::from("/tmp/out"));
        c.workers = Some(0);
        c.log_level = Some(LevelFilter::Trace);
        let s = Settings::resolve(&c, &batch, base);
        assert_eq!(s.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(s.workers, 1);
        assert_eq!(s.level, LevelFilter::Trace);

        let s = Settings::resolve(&cli(base.join("b.toml")), &BatchFile::default(), base);
        assert_eq!(s.output_dir, base.join("output"));
        assert_eq!(s.level, LevelFilter::Info);
        assert!(s.workers >= 1);
    }

    #[test]
    fn test_execute_batch() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();

        // 两个不同增强模式的半区.
        let data = Array4::from_shape_fn((8, 8, 4, 10), |(x, y, z, t)| {
            let slope = if x < 4 { 2.0 } else { 0.5 };
            100.0 + slope * t as f32 + (y + z) as f32 * 0.01
        });
        PerfVolume::new(data, Grid::new([1.0, 1.0, 2.0]))
            .save(base.join("dce.nii.gz"))
            .unwrap();
        let roi = Array3::from_shape_fn((8, 8, 4), |(x, y, _)| u32::from((1..7).contains(&x) && (1..7).contains(&y)));
        LabelVolume::new(roi, Grid::new([1.0, 1.0, 2.0]))
            .save(base.join("roi.nii.gz"))
            .unwrap();

        // 曲线归一化的输出作为之后超体素条目的输入.
        let text = r#"
            [[process]]
            kind = "curve-normalise"
            data = "dce.nii.gz"
            output-name = "norm"

            [[process]]
            kind = "supervoxels"
            data = "norm/norm.nii.gz"
            roi = "roi.nii.gz"
            n-components = 2
            n-supervoxels = 4
            output-name = "sv"

            [[process]]
            kind = "supervoxels"
            data = "missing.nii.gz"
            roi = "roi.nii.gz"
            output-name = "broken"

            [[process]]
            kind = "pca"
            data = "dce.nii.gz"
            roi = "roi.nii.gz"
            n-components = 2

            [[process]]
            kind = "mean-values"
            data = "dce.nii.gz"
            labels = "sv/sv.nii.gz"
        "#;
        let batch: BatchFile = toml::from_str(text).unwrap();
        let out = base.join("output");
        let pool = WorkerPool::new(2);
        let result = execute(&batch, base, &out, &pool);
        pool.shutdown();

        let entries = result.entries();
        assert_eq!(entries.len(), 5);
        let kinds: Vec<_> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, ["curve-normalise", "supervoxels", "supervoxels", "pca", "mean-values"]);
        assert!(entries[0].is_success(), "{:?}", entries[0].error);
        assert!(entries[1].is_success(), "{:?}", entries[1].error);
        assert!(!entries[2].is_success());
        assert!(entries[2].files.is_empty());
        assert!(entries[3..].iter().all(EntryResult::is_success));
        assert!(!result.all_succeeded());

        assert!(out.join("norm/norm.nii.gz").exists());
        assert!(out.join("sv/sv.nii.gz").exists());
        assert!(out.join("sv/sv.npz").exists());
        assert!(out.join("sv/sv_border.png").exists());
        assert!(out.join("sv/logfile").exists());
        assert!(out.join("pca/pca0.nii.gz").exists());
        assert!(out.join("pca/pca_modes.npz").exists());
        assert!(!out.join("broken").exists());

        let labels = LabelVolume::open(out.join("sv/sv.nii.gz")).unwrap();
        assert_eq!(labels.spatial_shape(), (8, 8, 4));
        assert_eq!(labels[(0, 0, 0)], 0);
        assert!(labels[(3, 3, 1)] > 0);

        let means = PerfVolume::open(out.join("means/means.nii.gz")).unwrap();
        assert_eq!(means.nvols(), 10);
        assert_eq!(means[(0, 0, 0, 5)], 0.0);
    }
}
