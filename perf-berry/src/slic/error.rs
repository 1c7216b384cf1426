//! 超体素聚类的配置错误.

use thiserror::Error;

use crate::Idx3d;

/// 超体素聚类的配置错误. 均在聚类开始之前同步返回.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClusterError {
    /// ROI 中没有任何活动体素.
    #[error("ROI 为空, 无法聚类")]
    InvalidMask,

    /// 超体素个数为 0 或超过活动体素个数.
    #[error("超体素个数 ({requested}) 非法, 活动体素个数为 {active}")]
    DegenerateSegmentCount {
        /// 所需超体素个数.
        requested: usize,
        /// 活动体素个数.
        active: usize,
    },

    /// ROI 形状与特征数据前三维不一致.
    #[error("ROI 形状 {mask:?} 与特征数据空间形状 {features:?} 不一致")]
    ShapeMismatch {
        /// ROI 形状.
        mask: Idx3d,
        /// 特征数据前三维形状.
        features: Idx3d,
    },

    /// 特征数据不含任何特征.
    #[error("特征数据不含任何特征")]
    NoFeatures,

    /// 紧凑度必须为正的有限值.
    #[error("紧凑度 ({0}) 必须为正数")]
    InvalidCompactness(f64),

    /// 体素分辨率必须为正的有限值.
    #[error("体素分辨率 {0:?} 非法")]
    InvalidSpacing([f64; 3]),
}

/// 聚类结果.
pub type ClusterResult<T> = Result<T, ClusterError>;
