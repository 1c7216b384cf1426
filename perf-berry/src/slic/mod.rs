//! ROI 内的 3D 超体素聚类 (SLIC).
//!
//! 在 "空间 + 特征" 联合空间中做迭代的中心聚类, 只处理 ROI 内的活动体素.
//!
//! 综合距离为
//!
//! ```text
//! D = d_spatial^2 / S^2 + d_feature^2 / (c^2 K)
//! ```
//!
//! 其中 `S` 为期望超体素边长 (以第一维体素为单位), `c` 为紧凑度, `K` 为特征个数.
//! 每个中心只搜索 `±2S` 范围内的体素.
//!
//! # 注意
//!
//! 1. 距离相等时, 体素归属于下标较小的中心.
//! 2. 迭代中失去所有成员的中心会被停用. 最终标签按照种子顺序重新编号为 `1..=N`,
//!    中间没有空缺; 停用个数记录在 `ClusterOutput::deactivated`.
//! 3. 迭代结束后未被任何搜索窗口覆盖的活动体素会被分配给全局最近的中心,
//!    因此每个活动体素都有且仅有一个非零标签.

use ndarray::{Array3, Axis};

use crate::consts::{DEFAULT_COMPACTNESS, DEFAULT_MAX_ITER, DEFAULT_RANDOM_SEED};
use crate::feature::FeatureVolume;
use crate::{filter, RoiMask};

mod adjacency;
mod engine;
mod error;
mod seed;

pub use adjacency::{border_map, border_slice_png, AdjacencyGraph};
pub use engine::Centroid;
pub use error::{ClusterError, ClusterResult};
pub use seed::SeedPolicy;

/// SLIC 参数.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct SlicParams {
    /// 期望的超体素个数.
    pub n_segments: usize,

    /// 紧凑度. 越小越看重特征相似性, 越大超体素形状越规则.
    pub compactness: f64,

    /// 聚类前对特征做空间高斯平滑的 sigma (以第一维体素为单位). 0 代表不平滑.
    pub sigma: f64,

    /// 种子放置策略.
    pub seed_policy: SeedPolicy,

    /// 是否在主迭代前先做仅含空间项的种子重算.
    pub recompute_seeds: bool,

    /// 最大迭代次数.
    pub max_iter: usize,

    /// 随机种子.
    pub random_seed: u64,
}

impl Default for SlicParams {
    fn default() -> Self {
        Self {
            n_segments: 20,
            compactness: DEFAULT_COMPACTNESS,
            sigma: 1.0,
            seed_policy: SeedPolicy::default(),
            recompute_seeds: true,
            max_iter: DEFAULT_MAX_ITER,
            random_seed: DEFAULT_RANDOM_SEED,
        }
    }
}

/// 聚类结果.
#[derive(Debug, Clone)]
pub struct ClusterOutput {
    /// 标签数据. 活动体素取值 `1..=n_segments`, 其余为 0.
    pub labels: Array3<u32>,

    /// 超体素邻接图.
    pub adjacency: AdjacencyGraph,

    /// 边界体素.
    pub border: Array3<bool>,

    /// 最终聚类中心, 第 `i` 个对应标签 `i + 1`.
    pub centroids: Vec<Centroid>,

    /// 最终超体素个数.
    pub n_segments: usize,

    /// 因失去所有成员而被停用的种子个数.
    pub deactivated: usize,

    /// 主迭代次数.
    pub iterations: usize,

    /// 主迭代是否在达到最大次数前收敛.
    pub converged: bool,
}

impl ClusterOutput {
    /// 统计每个标签的体素个数, 下标 `i` 对应标签 `i + 1`.
    pub fn segment_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.n_segments];
        self.labels
            .iter()
            .filter(|l| **l > 0)
            .for_each(|l| sizes[*l as usize - 1] += 1);
        sizes
    }
}

/// 检查配置. 所有配置错误都在这里同步返回.
///
/// `dim` 为特征数据形状 `(x, y, z, k)`. 成功时返回活动体素个数.
pub fn validate(
    dim: (usize, usize, usize, usize),
    spacing: [f64; 3],
    mask: &RoiMask,
    params: &SlicParams,
) -> ClusterResult<usize> {
    let (x, y, z, k) = dim;
    if mask.shape() != (x, y, z) {
        return Err(ClusterError::ShapeMismatch {
            mask: mask.shape(),
            features: (x, y, z),
        });
    }
    if k == 0 {
        return Err(ClusterError::NoFeatures);
    }
    if !spacing.iter().all(|s| s.is_finite() && *s > 0.0) {
        return Err(ClusterError::InvalidSpacing(spacing));
    }
    if !(params.compactness.is_finite() && params.compactness > 0.0) {
        return Err(ClusterError::InvalidCompactness(params.compactness));
    }
    let active = mask.count();
    if active == 0 {
        return Err(ClusterError::InvalidMask);
    }
    if params.n_segments == 0 || params.n_segments > active {
        return Err(ClusterError::DegenerateSegmentCount {
            requested: params.n_segments,
            active,
        });
    }
    Ok(active)
}

/// 在 ROI 内对特征数据做超体素聚类.
///
/// # 参数
///
/// * `features` - 逐体素特征, 形状 `(x, y, z, k)`.
/// * `spacing` - 体素分辨率. 只有相对比例有意义.
/// * `mask` - ROI, 形状必须与 `features` 前三维一致.
/// * `params` - 聚类参数.
///
/// # 返回值
///
/// ROI 为空时返回 `Err(ClusterError::InvalidMask)`;
/// 超体素个数为 0 或超过活动体素个数时返回 `Err(ClusterError::DegenerateSegmentCount)`.
#[inline]
pub fn cluster(
    features: &FeatureVolume,
    spacing: [f64; 3],
    mask: &RoiMask,
    params: &SlicParams,
) -> ClusterResult<ClusterOutput> {
    cluster_with_progress(features, spacing, mask, params, |_, _| {})
}

/// 同 [`cluster`], 但每完成一次迭代调用一次 `progress(done, total)`.
///
/// `total` 是计划的最大迭代次数 (含种子重算), 提前收敛时最后一次调用满足 `done == total`.
pub fn cluster_with_progress<F>(
    features: &FeatureVolume,
    spacing: [f64; 3],
    mask: &RoiMask,
    params: &SlicParams,
    mut progress: F,
) -> ClusterResult<ClusterOutput>
where
    F: FnMut(usize, usize),
{
    let active = validate(features.data().dim(), spacing, mask, params)?;
    let spacing = spacing.map(|s| s / spacing[0]);

    let mut smoothed = features.data().to_owned();
    if params.sigma > 0.0 {
        filter::smooth_spatial(&mut smoothed, spacing.map(|s| params.sigma / s));
    }

    let seeds = seed::place_seeds(
        mask,
        spacing,
        params.n_segments,
        params.seed_policy,
        params.random_seed,
    );
    log::info!(
        "SLIC: {active} 个活动体素, {} 个特征, {} 个种子 ({:?})",
        smoothed.len_of(Axis(3)),
        seeds.len(),
        params.seed_policy
    );

    let max_iter = params.max_iter.max(1);
    let passes = if params.recompute_seeds { 2 } else { 1 };
    let total = passes * max_iter;
    let mut done = 0;

    let mut core = engine::SlicCore::new(smoothed.view(), mask, spacing, &seeds, params.compactness);
    if params.recompute_seeds {
        let (_, it, _) = core.run(max_iter, true, || {
            done += 1;
            progress(done, total);
        });
        log::debug!("SLIC: 种子重算 {it} 次迭代");
        done = max_iter;
    }
    let (mut labels, iterations, converged) = core.run(max_iter, false, || {
        done += 1;
        progress(done, total);
    });
    if done < total {
        progress(total, total);
    }

    let filled = core.fill_unreached(&mut labels);
    if filled > 0 {
        log::debug!("SLIC: {filled} 个体素未被搜索窗口覆盖, 分配给最近的中心");
    }
    let (labels, centroids) = core.renumber(&labels);
    let n_segments = centroids.len();
    let deactivated = seeds.len() - n_segments;
    if deactivated > 0 {
        log::warn!("SLIC: {deactivated} 个种子失去所有成员, 最终超体素个数为 {n_segments}");
    }

    let adjacency = AdjacencyGraph::from_labels(labels.view());
    let border = border_map(labels.view());
    log::info!(
        "SLIC: {n_segments} 个超体素, {} 条邻接边, {iterations} 次迭代{}",
        adjacency.edge_count(),
        if converged { " (已收敛)" } else { "" }
    );

    Ok(ClusterOutput {
        labels,
        adjacency,
        border,
        centroids,
        n_segments,
        deactivated,
        iterations,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn features_of(shape: (usize, usize, usize), k: usize) -> FeatureVolume {
        let (x, y, z) = shape;
        FeatureVolume::new(Array4::from_shape_fn((x, y, z, k), |(i, _, _, c)| {
            (i as f64 / x as f64) + c as f64 * 0.1
        }))
    }

    #[test]
    fn test_validate_errors() {
        let f = features_of((4, 4, 4), 2);
        let params = SlicParams::default();
        let empty = RoiMask::from_fn((4, 4, 4), |_| false);
        assert_eq!(
            cluster(&f, [1.0; 3], &empty, &params).unwrap_err(),
            ClusterError::InvalidMask
        );

        let mask = RoiMask::full((4, 4, 4));
        let too_many = SlicParams {
            n_segments: 65,
            ..Default::default()
        };
        assert_eq!(
            cluster(&f, [1.0; 3], &mask, &too_many).unwrap_err(),
            ClusterError::DegenerateSegmentCount {
                requested: 65,
                active: 64
            }
        );
        let zero = SlicParams {
            n_segments: 0,
            ..Default::default()
        };
        assert!(matches!(
            cluster(&f, [1.0; 3], &mask, &zero),
            Err(ClusterError::DegenerateSegmentCount { requested: 0, .. })
        ));

        let wrong = RoiMask::full((4, 4, 3));
        assert!(matches!(
            cluster(&f, [1.0; 3], &wrong, &params),
            Err(ClusterError::ShapeMismatch { .. })
        ));
        let bad_c = SlicParams {
            compactness: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            cluster(&f, [1.0; 3], &mask, &bad_c),
            Err(ClusterError::InvalidCompactness(_))
        ));
        assert!(matches!(
            cluster(&f, [1.0, -1.0, 1.0], &mask, &params),
            Err(ClusterError::InvalidSpacing(_))
        ));
    }

    /// 每个活动体素恰有一个非零标签, 非活动体素标签为 0.
    #[test]
    fn test_partition() {
        let f = features_of((10, 10, 10), 3);
        let mask = RoiMask::sphere((10, 10, 10), [4.5; 3], 4.0);
        for policy in [SeedPolicy::Grid, SeedPolicy::Random, SeedPolicy::Farthest] {
            let params = SlicParams {
                n_segments: 8,
                seed_policy: policy,
                ..Default::default()
            };
            let out = cluster(&f, [1.0; 3], &mask, &params).unwrap();
            assert!(out.n_segments >= 1 && out.n_segments <= 8);
            for (pos, &l) in out.labels.indexed_iter() {
                if mask[pos] {
                    assert!(l >= 1 && l as usize <= out.n_segments);
                } else {
                    assert_eq!(l, 0);
                }
            }
            assert_eq!(out.segment_sizes().iter().sum::<usize>(), mask.count());
            assert!(out.segment_sizes().iter().all(|s| *s > 0));
        }
    }

    /// 网格种子不会超过请求的超体素个数.
    #[test]
    fn test_grid_respects_requested_count() {
        let f = features_of((10, 10, 10), 2);
        let mask = RoiMask::full((10, 10, 10));
        for n in [7, 26] {
            let params = SlicParams {
                n_segments: n,
                seed_policy: SeedPolicy::Grid,
                ..Default::default()
            };
            let out = cluster(&f, [1.0; 3], &mask, &params).unwrap();
            assert!(out.n_segments <= n, "n = {n}: {}", out.n_segments);
            assert!(out.labels.iter().all(|l| *l as usize <= n));
        }
    }

        /// 网格种子下结果完全确定.
    #[test]
    fn test_grid_deterministic() {
        let f = features_of((8, 8, 8), 2);
        let mask = RoiMask::full((8, 8, 8));
        let params = SlicParams {
            n_segments: 8,
            seed_policy: SeedPolicy::Grid,
            ..Default::default()
        };
        let a = cluster(&f, [1.0, 1.0, 2.0], &mask, &params).unwrap();
        let b = cluster(&f, [1.0, 1.0, 2.0], &mask, &params).unwrap();
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.adjacency, b.adjacency);
    }

    /// 进度单调不减, 并以 `done == total` 结束.
    #[test]
    fn test_progress_reported() {
        let f = features_of((6, 6, 6), 1);
        let mask = RoiMask::full((6, 6, 6));
        let params = SlicParams {
            n_segments: 4,
            ..Default::default()
        };
        let mut seen = Vec::new();
        cluster_with_progress(&f, [1.0; 3], &mask, &params, |d, t| seen.push((d, t))).unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
        let (d, t) = *seen.last().unwrap();
        assert_eq!(d, t);
        assert_eq!(t, 2 * DEFAULT_MAX_ITER);
    }
}
