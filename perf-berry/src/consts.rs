//! 通用常量.

use std::time::Duration;

/// 标签值.
pub mod label {
    /// ROI 之外 (非活动体素) 的标签值.
    pub const BACKGROUND: u32 = 0;

    /// 第一个超体素的标签值. 超体素标签从 1 开始连续编号.
    pub const FIRST_SEGMENT: u32 = 1;

    /// 体素是否属于某个超体素?
    #[inline]
    pub const fn is_segment(label: u32) -> bool {
        label != BACKGROUND
    }

    /// 体素是否为背景?
    #[inline]
    pub const fn is_background(label: u32) -> bool {
        label == BACKGROUND
    }
}

/// 计算增强曲线基线所用的时间点个数.
pub const BASELINE_POINTS: usize = 3;

/// 信号增强归一化和 \[0, 1\] 缩放时加到分母上的小量, 防止除零.
pub const NORM_EPSILON: f64 = 0.001;

/// `NormType::Percentile` 默认使用的百分位.
pub const DEFAULT_PERCENTILE: f64 = 90.0;

/// 超体素流程对时间序列做 1D 高斯平滑的默认 sigma.
pub const DEFAULT_TIMESERIES_SIGMA: f64 = 2.0;

/// 高斯核截断位置 (单位: sigma).
pub const GAUSSIAN_TRUNCATE: f64 = 4.0;

/// SLIC 默认最大迭代次数.
pub const DEFAULT_MAX_ITER: usize = 10;

/// 默认 PCA 主成分个数.
pub const DEFAULT_N_COMPONENTS: usize = 3;

/// 默认紧凑度.
pub const DEFAULT_COMPACTNESS: f64 = 0.1;

/// 默认随机种子.
pub const DEFAULT_RANDOM_SEED: u64 = 0x5eed;

/// 后台任务轮询 (进度汇报) 的默认周期.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// 处理流程日志的最大字符数. 超出部分会被截断.
pub const MAX_LOG_SIZE: usize = 100_000;
