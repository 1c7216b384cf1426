//! 各流程的参数. 键名即批处理文件中的键名.

use crate::consts::{
    DEFAULT_COMPACTNESS, DEFAULT_MAX_ITER, DEFAULT_N_COMPONENTS, DEFAULT_RANDOM_SEED,
    DEFAULT_TIMESERIES_SIGMA,
};
use crate::feature::{BaselineMode, NormType, PcaOptions};
use crate::slic::{SeedPolicy, SlicParams};

/// 未指定 `n-supervoxels` 与 `segment-size` 时的超体素个数.
const DEFAULT_N_SUPERVOXELS: usize = 20;

/// 超体素流程参数.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct SupervoxelOptions {
    /// 4D 数据降维后保留的主成分个数.
    pub n_components: usize,

    /// 紧凑度.
    pub compactness: f64,

    /// 聚类前特征空间平滑的 sigma.
    pub sigma: f64,

    /// 超体素个数. 优先于 `segment_size`.
    pub n_supervoxels: Option<usize>,

    /// 期望的单个超体素体素数. 超体素个数取 `活动体素数 / segment_size` 四舍五入, 至少为 1.
    pub segment_size: Option<usize>,

    /// 种子放置策略.
    pub seed_type: SeedPolicy,

    /// 是否重算种子.
    pub recompute_seeds: bool,

    /// 最大迭代次数.
    pub max_iter: usize,

    /// 随机种子.
    pub random_seed: u64,

    /// PCA 之前是否做输入归一化.
    pub normalise_input: bool,

    /// PCA 输入归一化方式.
    pub norm_type: NormType,

    /// 时间序列平滑的 sigma. `None` 代表不平滑.
    pub smooth_timeseries: Option<f64>,

    /// 输出名称.
    pub output_name: String,
}

impl Default for SupervoxelOptions {
    fn default() -> Self {
        Self {
            n_components: DEFAULT_N_COMPONENTS,
            compactness: DEFAULT_COMPACTNESS,
            sigma: 1.0,
            n_supervoxels: None,
            segment_size: None,
            seed_type: SeedPolicy::default(),
            recompute_seeds: true,
            max_iter: DEFAULT_MAX_ITER,
            random_seed: DEFAULT_RANDOM_SEED,
            normalise_input: true,
            norm_type: NormType::Percentile,
            smooth_timeseries: Some(DEFAULT_TIMESERIES_SIGMA),
            output_name: "supervoxels".to_string(),
        }
    }
}

impl SupervoxelOptions {
    /// 活动体素个数为 `active` 时请求的超体素个数.
    ///
    /// `segment-size` 为 0 时返回 0, 随后的检查会将其报告为非法超体素个数.
    pub fn segments_for(&self, active: usize) -> usize {
        match (self.n_supervoxels, self.segment_size) {
            (Some(n), _) => n,
            (None, Some(0)) => 0,
            (None, Some(size)) => ((active as f64 / size as f64).round() as usize).max(1),
            (None, None) => DEFAULT_N_SUPERVOXELS,
        }
    }

    /// 对应的聚类参数.
    pub fn slic_params(&self, active: usize) -> SlicParams {
        SlicParams {
            n_segments: self.segments_for(active),
            compactness: self.compactness,
            sigma: self.sigma,
            seed_policy: self.seed_type,
            recompute_seeds: self.recompute_seeds,
            max_iter: self.max_iter,
            random_seed: self.random_seed,
        }
    }

    /// 对应的降维参数. 主成分总是缩放到 \[0, 1\].
    pub fn pca_options(&self) -> PcaOptions {
        PcaOptions {
            n_components: self.n_components,
            normalise_input: self.normalise_input,
            norm_type: self.norm_type,
            smooth_timeseries: self.smooth_timeseries,
            norm_modes: true,
        }
    }
}

/// PCA 流程参数.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct PcaProcessOptions {
    /// 主成分个数. 必须小于时间点个数.
    pub n_components: usize,

    /// 是否做输入归一化.
    #[cfg_attr(feature = "serde", serde(alias = "norm-input"))]
    pub normalise_input: bool,

    /// 输入归一化方式.
    pub norm_type: NormType,

    /// 是否将每个主成分缩放到 \[0, 1\].
    pub norm_output: bool,

    /// 时间序列平滑的 sigma.
    pub smooth_timeseries: Option<f64>,

    /// 输出名称前缀. 第 `i` 个主成分保存为 `<output-name><i>`.
    pub output_name: String,
}

impl Default for PcaProcessOptions {
    fn default() -> Self {
        Self {
            n_components: 5,
            normalise_input: true,
            norm_type: NormType::SigEnh,
            norm_output: false,
            smooth_timeseries: None,
            output_name: "pca".to_string(),
        }
    }
}

impl PcaProcessOptions {
    /// 对应的降维参数.
    pub fn pca_options(&self) -> PcaOptions {
        PcaOptions {
            n_components: self.n_components,
            normalise_input: self.normalise_input,
            norm_type: self.norm_type,
            smooth_timeseries: self.smooth_timeseries,
            norm_modes: self.norm_output,
        }
    }
}

/// 曲线归一化流程参数.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct CurveNormaliseOptions {
    /// 基线处理方式.
    pub mode: BaselineMode,

    /// 输出名称.
    pub output_name: String,
}

impl Default for CurveNormaliseOptions {
    fn default() -> Self {
        Self {
            mode: BaselineMode::default(),
            output_name: "normalised".to_string(),
        }
    }
}

/// 区域均值流程参数.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct MeanValuesOptions {
    /// 输出名称.
    pub output_name: String,
}

impl Default for MeanValuesOptions {
    fn default() -> Self {
        Self { output_name: "means".to_string() }
    }
}
