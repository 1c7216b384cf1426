//! 处理流程. 批处理程序和交互调用共用同一套参数.
//!
//! 所有流程都遵守同样的约定:
//!
//! 1. 配置错误 (形状不一致, 空 ROI, 非法参数) 在启动任何后台任务之前同步返回;
//! 2. 后台任务中的错误通过 [`TaskHandle`](crate::task::TaskHandle) 报告一次;
//! 3. 线程池由调用者创建并注入, 流程本身不持有任何全局状态.

use thiserror::Error;

use crate::feature::FeatureError;
use crate::slic::ClusterError;
use crate::task::TaskError;
use crate::VolumeError;

mod curves;
mod means;
mod options;
mod pca;
mod supervoxels;

pub use curves::CurveNormaliseProcess;
pub use means::MeanValuesProcess;
pub use options::{CurveNormaliseOptions, MeanValuesOptions, PcaProcessOptions, SupervoxelOptions};
pub use pca::{PcaProcess, PcaReport};
pub use supervoxels::{SupervoxelProcess, SupervoxelReport};

/// 处理流程错误.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// 读写或构造体素数据失败.
    #[error(transparent)]
    Volume(#[from] VolumeError),

    /// 特征提取失败.
    #[error(transparent)]
    Feature(#[from] FeatureError),

    /// 超体素聚类失败.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// 后台任务失败.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// 流程只接受 4D 数据.
    #[error("该流程只能用于 4D 数据, 输入只有 {0} 个时间点")]
    NotTimeSeries(usize),

    /// 主成分个数必须小于时间点个数.
    #[error("主成分个数 ({requested}) 必须小于时间点个数 ({nvols})")]
    TooManyComponents {
        /// 请求的主成分个数.
        requested: usize,
        /// 时间点个数.
        nvols: usize,
    },

    /// 保存 `.npz` 文件失败.
    #[error("写入 npz 失败: {0}")]
    Npz(#[from] ndarray_npy::WriteNpzError),

    /// 保存图像失败.
    #[error("写入图像失败: {0}")]
    Image(#[from] image::ImageError),

    /// 文件读写失败.
    #[error("文件读写失败: {0}")]
    Io(#[from] std::io::Error),
}

/// 处理流程结果.
pub type ProcessResult<T> = Result<T, ProcessError>;
