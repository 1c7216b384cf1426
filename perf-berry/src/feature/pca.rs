//! 主成分分析.

use std::fmt;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use once_cell::sync::Lazy;
use ordered_float::OrderedFloat;

use super::error::{FeatureError, FeatureResult};

/// 协方差矩阵特征分解所用的后端.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EigenBackend {
    /// 纯 Rust 实现 (`nalgebra`).
    Nalgebra,

    /// LAPACK (`ndarray-linalg`).
    Lapack,
}

impl fmt::Display for EigenBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EigenBackend::Nalgebra => write!(f, "nalgebra"),
            EigenBackend::Lapack => write!(f, "ndarray-linalg (LAPACK)"),
        }
    }
}

static BACKEND: Lazy<EigenBackend> = Lazy::new(|| {
    let backend = if cfg!(feature = "lapack") {
        EigenBackend::Lapack
    } else {
        EigenBackend::Nalgebra
    };
    log::info!("PCA 特征分解后端: {backend}");
    backend
});

impl EigenBackend {
    /// 当前编译配置下使用的后端. 仅在第一次调用时检测并记录日志.
    #[inline]
    pub fn current() -> Self {
        *BACKEND
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "lapack")] {
        /// 对称矩阵特征分解. 返回 (特征值, 以列存储的特征向量).
        fn symmetric_eigen(cov: &Array2<f64>) -> FeatureResult<(Array1<f64>, Array2<f64>)> {
            use ndarray_linalg::{Eigh, UPLO};
            cov.eigh(UPLO::Lower).map_err(|e| {
                log::error!("LAPACK 特征分解失败: {e}");
                FeatureError::Singular
            })
        }
    } else {
        /// 对称矩阵特征分解. 返回 (特征值, 以列存储的特征向量).
        fn symmetric_eigen(cov: &Array2<f64>) -> FeatureResult<(Array1<f64>, Array2<f64>)> {
            let n = cov.nrows();
            let m = nalgebra::DMatrix::from_fn(n, n, |i, j| cov[(i, j)]);
            let eig = m.symmetric_eigen();
            let values = eig.eigenvalues.iter().copied().collect::<Array1<f64>>();
            let vectors = Array2::from_shape_fn((n, n), |(i, j)| eig.eigenvectors[(i, j)]);
            Ok((values, vectors))
        }
    }
}

/// 拟合好的 PCA 模型.
#[derive(Debug, Clone)]
pub struct PcaModel {
    /// 主成分, 每行一个, 按特征值降序排列. 形状 `(k, t)`.
    components: Array2<f64>,
    /// 每个主成分的解释方差比例.
    explained: Vec<f64>,
    /// 拟合数据的均值. 长度 `t`.
    mean: Array1<f64>,
}

impl PcaModel {
    /// 对 `体素 × 时间` 矩阵 `x` 拟合 `k` 个主成分.
    ///
    /// # 注意
    ///
    /// 主成分符号是确定的: 绝对值最大的载荷为正.
    pub fn fit(x: ArrayView2<f64>, k: usize) -> FeatureResult<Self> {
        let (n, t) = x.dim();
        if k == 0 {
            return Err(FeatureError::ZeroComponents);
        }
        if k > t {
            return Err(FeatureError::TooManyComponents {
                requested: k,
                timepoints: t,
            });
        }
        if n < k {
            return Err(FeatureError::InsufficientData {
                active: n,
                requested: k,
            });
        }

        let mean = x.mean_axis(Axis(0)).ok_or(FeatureError::InsufficientData {
            active: 0,
            requested: k,
        })?;
        let centred = &x - &mean;
        let dof = n.saturating_sub(1).max(1) as f64;
        let cov = centred.t().dot(&centred) / dof;

        let (values, vectors) = symmetric_eigen(&cov)?;
        if !values.iter().chain(vectors.iter()).all(|v| v.is_finite()) {
            return Err(FeatureError::Singular);
        }

        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(OrderedFloat(values[i])));

        let total: f64 = values.iter().map(|v| v.max(0.0)).sum();
        let mut components = Array2::zeros((k, t));
        let mut explained = Vec::with_capacity(k);
        for (row, &i) in order.iter().take(k).enumerate() {
            let mut v = vectors.column(i).to_owned();
            let pivot = v
                .iter()
                .copied()
                .max_by_key(|a| OrderedFloat(a.abs()))
                .unwrap_or(0.0);
            if pivot < 0.0 {
                v.mapv_inplace(|a| -a);
            }
            components.row_mut(row).assign(&v);
            explained.push(if total > 0.0 {
                values[i].max(0.0) / total
            } else {
                0.0
            });
        }

        log::debug!(
            "PCA: {n} 个样本, {t} 个时间点, 保留 {k} 个主成分, 解释方差 {explained:?}"
        );
        Ok(Self {
            components,
            explained,
            mean,
        })
    }

    /// 将 `体素 × 时间` 矩阵投影到主成分空间. 返回 `体素 × k` 矩阵.
    ///
    /// 当时间点个数与模型不一致时 panic.
    pub fn transform(&self, x: ArrayView2<f64>) -> Array2<f64> {
        assert_eq!(x.ncols(), self.mean.len(), "时间点个数与模型不一致");
        (&x - &self.mean).dot(&self.components.t())
    }

    /// 主成分个数.
    #[inline]
    pub fn n_components(&self) -> usize {
        self.components.nrows()
    }

    /// 主成分矩阵, 形状 `(k, t)`.
    #[inline]
    pub fn components(&self) -> ArrayView2<'_, f64> {
        self.components.view()
    }

    /// 每个主成分的解释方差比例.
    #[inline]
    pub fn explained_variance(&self) -> &[f64] {
        &self.explained
    }

    /// 拟合数据的均值曲线.
    #[inline]
    pub fn mean(&self) -> ArrayView1<'_, f64> {
        self.mean.view()
    }
}
