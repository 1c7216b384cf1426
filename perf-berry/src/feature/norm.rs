//! 增强曲线归一化.

use itertools::Itertools;
use ndarray::{Array2, ArrayView1, ArrayViewMut1, Axis, Zip};
use ordered_float::OrderedFloat;

use crate::consts::{BASELINE_POINTS, DEFAULT_PERCENTILE, NORM_EPSILON};
use crate::filter;

/// 基线处理方式.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum BaselineMode {
    /// `v - b`.
    #[default]
    Subtract,

    /// 信号增强 `v / (b + 0.001) - 1`.
    Enhancement,
}

/// PCA 之前对体素 × 时间矩阵的输入归一化方式.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum NormType {
    /// 除以全部数据的第 90 百分位数.
    #[default]
    #[cfg_attr(feature = "serde", serde(alias = "perc"))]
    Percentile,

    /// 除以中间时间点的中位数.
    Median,

    /// 各时间点 (列) 分别缩放到 \[0, 1\].
    Indiv,

    /// 信号增强, 以前 3 个时间点为基线.
    #[cfg_attr(feature = "serde", serde(rename = "sigenh"))]
    SigEnh,
}

/// 前 `BASELINE_POINTS` 个时间点的均值. 时间点不足时使用全部时间点.
#[inline]
pub(crate) fn baseline_of<T: num::ToPrimitive>(curve: ArrayView1<T>) -> f64 {
    let n = curve.len().min(BASELINE_POINTS).max(1);
    curve
        .iter()
        .take(n)
        .map(|v| v.to_f64().unwrap_or(0.0))
        .sum::<f64>()
        / n as f64
}

/// 原地归一化单条 `f32` 曲线.
pub(crate) fn normalize_curve(mut curve: ArrayViewMut1<f32>, mode: BaselineMode) {
    let b = baseline_of(curve.view());
    match mode {
        BaselineMode::Subtract => curve.mapv_inplace(|v| (v as f64 - b) as f32),
        BaselineMode::Enhancement => {
            curve.mapv_inplace(|v| (v as f64 / (b + NORM_EPSILON) - 1.0) as f32)
        }
    }
}

/// 升序排列后的线性插值百分位数. `p` 取值 \[0, 100\].
///
/// 空输入返回 `None`. NaN 按最大值处理.
pub fn percentile<I: IntoIterator<Item = f64>>(values: I, p: f64) -> Option<f64> {
    let sorted = values
        .into_iter()
        .map(OrderedFloat)
        .sorted_unstable()
        .collect_vec();
    if sorted.is_empty() {
        return None;
    }
    let pos = p.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo].0 + (sorted[hi].0 - sorted[lo].0) * frac)
}

/// 除以 `scale`. `scale` 为 0 或非有限值时保持不变.
fn divide_by(m: &mut Array2<f64>, scale: Option<f64>) {
    match scale {
        Some(s) if s != 0.0 && s.is_finite() => m.mapv_inplace(|v| v / s),
        _ => log::warn!("归一化尺度无效 ({scale:?}), 跳过输入归一化"),
    }
}

/// 对 `体素 × 时间` 矩阵做输入归一化.
pub(crate) fn normalise_matrix(m: &mut Array2<f64>, norm: NormType) {
    if m.is_empty() {
        return;
    }
    match norm {
        NormType::Percentile => {
            let p = percentile(m.iter().copied(), DEFAULT_PERCENTILE);
            divide_by(m, p);
        }
        NormType::Median => {
            let mid = m.ncols() / 2;
            let med = percentile(m.column(mid).iter().copied(), 50.0);
            divide_by(m, med);
        }
        NormType::Indiv => {
            for mut col in m.axis_iter_mut(Axis(1)) {
                let min = col.iter().copied().fold(f64::INFINITY, f64::min);
                col.mapv_inplace(|v| v - min);
                let max = col.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                col.mapv_inplace(|v| v / (max + NORM_EPSILON));
            }
        }
        NormType::SigEnh => {
            for mut row in m.axis_iter_mut(Axis(0)) {
                let b = baseline_of(row.view());
                row.mapv_inplace(|v| v / (b + NORM_EPSILON) - 1.0);
            }
        }
    }
}

/// 对矩阵每一行 (即每条时间序列) 做一维高斯平滑.
pub(crate) fn smooth_rows(m: &mut Array2<f64>, sigma: f64) {
    if sigma <= 0.0 || m.ncols() < 2 {
        return;
    }
    let kernel = filter::gaussian_kernel(sigma);
    let src = m.clone();
    Zip::from(m.rows_mut())
        .and(src.rows())
        .for_each(|dst, src| filter::convolve_lane(src, dst, &kernel));
}

/// 每列缩放到 \[0, 1\]: `(x - min) / (max - min + 0.001)`. 返回每列的 `(min, max)`.
pub(crate) fn scale_columns(m: &mut Array2<f64>) -> Vec<(f64, f64)> {
    m.axis_iter_mut(Axis(1))
        .map(|mut col| {
            let min = col.iter().copied().fold(f64::INFINITY, f64::min);
            let max = col.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            col.mapv_inplace(|v| (v - min) / (max - min + NORM_EPSILON));
            (min, max)
        })
        .collect()
}

/// 使用给定的 `(min, max)` 缩放每一列.
pub(crate) fn apply_column_scale(m: &mut Array2<f64>, scale: &[(f64, f64)]) {
    for (mut col, (min, max)) in m.axis_iter_mut(Axis(1)).zip(scale.iter().copied()) {
        col.mapv_inplace(|v| (v - min) / (max - min + NORM_EPSILON));
    }
}
