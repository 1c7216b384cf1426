//! 增强曲线特征提取.
//!
//! 给定 4D 灌注数据, 该模块先对每个体素的时间曲线做基线归一化,
//! 再将 ROI 内的曲线投影到少数几个主成分上, 得到逐体素的特征向量.
//!
//! # 注意
//!
//! 所有操作都不修改输入, 而是返回新的数组.
//! 特征按照 ROI 行优先的体素顺序收集, 并以同样的顺序写回, 因此空间对应关系严格保持.

use ndarray::{s, Array2, Array3, Array4, ArrayView1, ArrayView3, ArrayView4, Axis};

use crate::consts::BASELINE_POINTS;
use crate::{Idx3d, RoiMask};

mod error;
mod norm;
mod pca;

pub use error::{FeatureError, FeatureResult};
pub use norm::{percentile, BaselineMode, NormType};
pub use pca::{EigenBackend, PcaModel};

/// 逐体素特征向量. 形状 `(x, y, z, k)`, ROI 外的体素特征为 0.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVolume {
    data: Array4<f64>,
}

impl FeatureVolume {
    /// 由裸数据直接创建.
    #[inline]
    pub fn new(data: Array4<f64>) -> Self {
        Self { data }
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView4<'_, f64> {
        self.data.view()
    }

    /// 消费自我, 获得底层数据.
    #[inline]
    pub fn into_data(self) -> Array4<f64> {
        self.data
    }

    /// 特征个数 `k`.
    #[inline]
    pub fn n_features(&self) -> usize {
        self.data.len_of(Axis(3))
    }

    /// 空间形状.
    #[inline]
    pub fn spatial_shape(&self) -> Idx3d {
        let (x, y, z, _) = self.data.dim();
        (x, y, z)
    }

    /// 第 `c` 个特征的 3D 视图.
    #[inline]
    pub fn feature_at(&self, c: usize) -> ArrayView3<'_, f64> {
        self.data.index_axis(Axis(3), c)
    }

    /// 体素 `(x, y, z)` 的特征向量.
    #[inline]
    pub fn vector_at(&self, (x, y, z): Idx3d) -> ArrayView1<'_, f64> {
        self.data.slice(s![x, y, z, ..])
    }
}

/// 对每个体素的时间曲线做基线归一化. 基线为前 3 个时间点的均值.
///
/// # 返回值
///
/// 新的 4D 数组. 时间点不足 3 个时返回 `Err(FeatureError::TooFewTimepoints)`.
pub fn normalize_curves(volume: ArrayView4<f32>, mode: BaselineMode) -> FeatureResult<Array4<f32>> {
    check_timepoints(volume)?;
    let mut out = volume.to_owned();
    out.lanes_mut(Axis(3))
        .into_iter()
        .for_each(|c| norm::normalize_curve(c, mode));
    Ok(out)
}

fn check_timepoints(volume: ArrayView4<f32>) -> FeatureResult<()> {
    let nt = volume.len_of(Axis(3));
    if nt < BASELINE_POINTS {
        return Err(FeatureError::TooFewTimepoints(nt, BASELINE_POINTS));
    }
    Ok(())
}

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use ndarray::Zip;

        /// 借助 `rayon`, 并行地运行 `normalize_curves`.
        pub fn par_normalize_curves(
            volume: ArrayView4<f32>,
            mode: BaselineMode,
        ) -> FeatureResult<Array4<f32>> {
            check_timepoints(volume)?;
            let mut out = volume.to_owned();
            Zip::from(out.lanes_mut(Axis(3))).par_for_each(|c| norm::normalize_curve(c, mode));
            Ok(out)
        }
    }
}

/// PCA 降维参数.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct PcaOptions {
    /// 保留的主成分个数.
    pub n_components: usize,

    /// 是否在 PCA 之前做输入归一化.
    pub normalise_input: bool,

    /// 输入归一化方式.
    pub norm_type: NormType,

    /// 时间序列一维高斯平滑的 sigma (单位: 时间点). `None` 代表不平滑.
    pub smooth_timeseries: Option<f64>,

    /// 是否将每个主成分缩放到 \[0, 1\].
    pub norm_modes: bool,
}

impl Default for PcaOptions {
    fn default() -> Self {
        Self {
            n_components: crate::consts::DEFAULT_N_COMPONENTS,
            normalise_input: true,
            norm_type: NormType::default(),
            smooth_timeseries: None,
            norm_modes: true,
        }
    }
}

/// PCA 降维结果.
#[derive(Debug, Clone)]
pub struct Reduction {
    /// 逐体素特征.
    pub features: FeatureVolume,

    /// 主成分名称, 依次为 `"PC1"`, `"PC2"`, ...
    pub component_labels: Vec<String>,

    /// 每个主成分的解释方差比例.
    pub explained_variance: Vec<f64>,

    model: PcaModel,
    options: PcaOptions,
    scale: Option<Vec<(f64, f64)>>,
}

impl Reduction {
    /// 拟合好的 PCA 模型.
    #[inline]
    pub fn model(&self) -> &PcaModel {
        &self.model
    }

    /// 累计解释方差比例.
    pub fn cumulative_explained_variance(&self) -> Vec<f64> {
        self.explained_variance
            .iter()
            .scan(0.0, |acc, v| {
                *acc += v;
                Some(*acc)
            })
            .collect()
    }

    /// 各主成分模式曲线 (主成分 + 均值), 形状 `(k, t)`.
    pub fn modes(&self) -> Array2<f64> {
        &self.model.components() + &self.model.mean()
    }

    /// 拟合数据的均值曲线.
    #[inline]
    pub fn mean(&self) -> ArrayView1<'_, f64> {
        self.model.mean()
    }

    /// 将已拟合的降维应用到新数据上.
    ///
    /// 新数据的预处理与拟合时相同; \[0, 1\] 缩放沿用拟合数据的尺度.
    pub fn project(&self, volume: ArrayView4<f32>, mask: Option<&RoiMask>) -> FeatureResult<FeatureVolume> {
        let expected = self.model.mean().len();
        let found = volume.len_of(Axis(3));
        if expected != found {
            return Err(FeatureError::TimepointMismatch { expected, found });
        }
        let positions = active_positions(volume, mask)?;
        let mut m = gather(volume, &positions);
        preprocess(&mut m, &self.options);
        let mut projected = self.model.transform(m.view());
        if let Some(scale) = &self.scale {
            norm::apply_column_scale(&mut projected, scale);
        }
        Ok(scatter(spatial_shape(volume), &positions, projected))
    }
}

#[inline]
fn spatial_shape<A>(volume: ArrayView4<A>) -> Idx3d {
    let (x, y, z, _) = volume.dim();
    (x, y, z)
}

/// ROI 内 (无 ROI 时为全部) 体素下标, 行优先.
fn active_positions(volume: ArrayView4<f32>, mask: Option<&RoiMask>) -> FeatureResult<Vec<Idx3d>> {
    let shape = spatial_shape(volume);
    match mask {
        Some(m) if m.shape() != shape => Err(FeatureError::ShapeMismatch {
            mask: m.shape(),
            volume: shape,
        }),
        Some(m) => Ok(m.positions()),
        None => Ok(ndarray::indices(shape).into_iter().collect()),
    }
}

/// 按 `positions` 顺序收集曲线, 得到 `体素 × 时间` 矩阵.
fn gather(volume: ArrayView4<f32>, positions: &[Idx3d]) -> Array2<f64> {
    let nt = volume.len_of(Axis(3));
    let mut m = Array2::zeros((positions.len(), nt));
    for (mut row, &(x, y, z)) in m.rows_mut().into_iter().zip(positions) {
        row.assign(&volume.slice(s![x, y, z, ..]).mapv(f64::from));
    }
    m
}

/// 按 `positions` 顺序将 `体素 × k` 矩阵写回 4D 数组.
fn scatter(shape: Idx3d, positions: &[Idx3d], values: Array2<f64>) -> FeatureVolume {
    let (x, y, z) = shape;
    let mut out = Array4::zeros((x, y, z, values.ncols()));
    for (row, &(i, j, k)) in values.rows().into_iter().zip(positions) {
        out.slice_mut(s![i, j, k, ..]).assign(&row);
    }
    FeatureVolume::new(out)
}

fn preprocess(m: &mut Array2<f64>, opts: &PcaOptions) {
    if opts.normalise_input {
        norm::normalise_matrix(m, opts.norm_type);
    }
    if let Some(sigma) = opts.smooth_timeseries {
        norm::smooth_rows(m, sigma);
    }
}

/// 对 ROI 内 (无 ROI 时为全部) 体素的时间曲线做 PCA 降维.
///
/// # 参数
///
/// * `volume` - 4D 数据 `(x, y, z, t)`.
/// * `mask` - 可选的 ROI, 形状必须与 `volume` 前三维一致.
/// * `opts` - 降维参数.
///
/// # 返回值
///
/// 活动体素个数少于主成分个数时返回 `Err(FeatureError::InsufficientData)`;
/// ROI 形状不一致时返回 `Err(FeatureError::ShapeMismatch)`.
pub fn reduce(volume: ArrayView4<f32>, mask: Option<&RoiMask>, opts: &PcaOptions) -> FeatureResult<Reduction> {
    let _ = EigenBackend::current();
    let positions = active_positions(volume, mask)?;
    let k = opts.n_components;
    if k == 0 {
        return Err(FeatureError::ZeroComponents);
    }
    if positions.len() < k {
        return Err(FeatureError::InsufficientData {
            active: positions.len(),
            requested: k,
        });
    }

    let mut m = gather(volume, &positions);
    preprocess(&mut m, opts);
    let model = PcaModel::fit(m.view(), k)?;
    let mut projected = model.transform(m.view());
    let scale = opts.norm_modes.then(|| norm::scale_columns(&mut projected));

    Ok(Reduction {
        features: scatter(spatial_shape(volume), &positions, projected),
        component_labels: (1..=k).map(|i| format!("PC{i}")).collect(),
        explained_variance: model.explained_variance().to_vec(),
        model,
        options: opts.clone(),
        scale,
    })
}

/// 单时间点数据的特征: ROI 内 (无 ROI 时为全部) 体素强度缩放到 \[0, 1\], `k = 1`.
pub fn scaled_intensity(volume: ArrayView3<f32>, mask: Option<&RoiMask>) -> FeatureResult<FeatureVolume> {
    let shape = volume.dim();
    if let Some(m) = mask {
        if m.shape() != shape {
            return Err(FeatureError::ShapeMismatch {
                mask: m.shape(),
                volume: shape,
            });
        }
    }
    let active = |pos: Idx3d| mask.map_or(true, |m| m[pos]);
    let (min, max) = volume
        .indexed_iter()
        .filter(|(pos, _)| active(*pos))
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, v)| {
            (lo.min(*v as f64), hi.max(*v as f64))
        });
    let range = max - min;
    let scaled = Array3::from_shape_fn(shape, |pos| match active(pos) {
        true if range > 0.0 => (volume[pos] as f64 - min) / range,
        _ => 0.0,
    });
    Ok(FeatureVolume::new(scaled.insert_axis(Axis(3))))
}
