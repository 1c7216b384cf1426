//! 特征提取的运行时错误.

use thiserror::Error;

use crate::Idx3d;

/// 曲线归一化或 PCA 降维时的错误.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeatureError {
    /// ROI 形状与数据前三维不一致.
    #[error("ROI 形状 {mask:?} 与数据空间形状 {volume:?} 不一致")]
    ShapeMismatch {
        /// ROI 形状.
        mask: Idx3d,
        /// 数据前三维形状.
        volume: Idx3d,
    },

    /// 活动体素个数少于所需主成分个数.
    #[error("活动体素个数 ({active}) 少于主成分个数 ({requested})")]
    InsufficientData {
        /// 活动体素个数.
        active: usize,
        /// 所需主成分个数.
        requested: usize,
    },

    /// 时间点个数不足以计算基线.
    ///
    /// 第一个参数代表实际时间点个数, 第二个参数代表最少需要的时间点个数.
    #[error("时间点个数 ({0}) 不足, 至少需要 {1} 个")]
    TooFewTimepoints(usize, usize),

    /// 主成分个数不小于时间点个数.
    #[error("主成分个数 ({requested}) 必须小于时间点个数 ({timepoints})")]
    TooManyComponents {
        /// 所需主成分个数.
        requested: usize,
        /// 时间点个数.
        timepoints: usize,
    },

    /// 投影数据的时间点个数与拟合数据不一致.
    #[error("时间点个数不一致: 模型为 {expected}, 数据为 {found}")]
    TimepointMismatch {
        /// 模型的时间点个数.
        expected: usize,
        /// 数据的时间点个数.
        found: usize,
    },

    /// 主成分个数为 0.
    #[error("主成分个数必须为正数")]
    ZeroComponents,

    /// 特征分解失败或结果不是有限值.
    #[error("协方差矩阵特征分解失败")]
    Singular,
}

/// 特征提取结果.
pub type FeatureResult<T> = Result<T, FeatureError>;
