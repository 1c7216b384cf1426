//! 批处理文件.
//!
//! ```toml
//! output-dir = "out"
//! workers = 4
//! log-level = "info"
//!
//! [[process]]
//! kind = "curve-normalise"
//! data = "dce.nii.gz"
//! output-name = "norm"
//!
//! [[process]]
//! kind = "supervoxels"
//! data = "norm/norm.nii.gz"
//! roi = "liver.nii.gz"
//! n-components = 3
//! compactness = 0.1
//! sigma = 1.0
//! n-supervoxels = 20
//! output-name = "sv"
//! ```
//!
//! 条目按文件中出现的顺序执行, 之后的条目可以引用之前条目的输出.
//! 浮点参数必须写成浮点形式 (`sigma = 1.0` 而非 `sigma = 1`).

use std::path::PathBuf;

use perf_berry::process::{CurveNormaliseOptions, MeanValuesOptions, PcaProcessOptions, SupervoxelOptions};
use serde::Deserialize;

/// 整个批处理文件.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct BatchFile {
    /// 输出目录, 相对于批处理文件所在目录.
    pub output_dir: Option<PathBuf>,

    /// worker 线程数.
    pub workers: Option<usize>,

    /// 日志级别.
    pub log_level: Option<String>,

    /// 按顺序执行的处理流程.
    pub process: Vec<BatchEntry>,
}

impl BatchFile {
    /// 条目总数.
    pub fn len(&self) -> usize {
        self.process.len()
    }

    /// 日志级别. 无法解析时返回 `None`.
    pub fn log_level(&self) -> Option<log::LevelFilter> {
        self.log_level.as_deref().and_then(|s| s.parse().ok())
    }
}

/// 一个 `[[process]]` 条目, 由 `kind` 键区分流程类型.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BatchEntry {
    Supervoxels(SupervoxelEntry),
    Pca(PcaEntry),
    MeanValues(MeanValuesEntry),
    CurveNormalise(CurveNormaliseEntry),
}

impl BatchEntry {
    /// 流程类型, 与 `kind` 键的取值相同.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Supervoxels(_) => "supervoxels",
            Self::Pca(_) => "pca",
            Self::MeanValues(_) => "mean-values",
            Self::CurveNormalise(_) => "curve-normalise",
        }
    }

    /// 输出名称.
    pub fn output_name(&self) -> &str {
        match self {
            Self::Supervoxels(e) => &e.options.output_name,
            Self::Pca(e) => &e.options.output_name,
            Self::MeanValues(e) => &e.options.output_name,
            Self::CurveNormalise(e) => &e.options.output_name,
        }
    }
}

/// 超体素流程条目.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SupervoxelEntry {
    /// 4D (或 3D) 数据.
    pub data: PathBuf,

    /// ROI.
    pub roi: PathBuf,

    /// 流程参数.
    #[serde(flatten)]
    pub options: SupervoxelOptions,
}

/// PCA 流程条目.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PcaEntry {
    /// 4D 数据.
    pub data: PathBuf,

    /// 可选的 ROI.
    #[serde(default)]
    pub roi: Option<PathBuf>,

    /// 流程参数.
    #[serde(flatten)]
    pub options: PcaProcessOptions,
}

/// 区域均值流程条目.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MeanValuesEntry {
    /// 数据.
    pub data: PathBuf,

    /// 标签数据 (例如超体素流程的输出).
    #[serde(alias = "roi")]
    pub labels: PathBuf,

    /// 流程参数.
    #[serde(flatten)]
    pub options: MeanValuesOptions,
}

/// 曲线归一化流程条目.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CurveNormaliseEntry {
    /// 4D 数据.
    pub data: PathBuf,

    /// 流程参数.
    #[serde(flatten)]
    pub options: CurveNormaliseOptions,
}
