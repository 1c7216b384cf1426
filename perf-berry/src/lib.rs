#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 提供 4D 灌注成像 (DCE-MRI / ASL / CEST) 数据的超体素生成、
//! 增强曲线 PCA 特征降维, 以及后台多任务执行框架.
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 体素数据按照 nifti 惯用的 `(x, y, z, t)` 顺序组织, 时间 (或特征) 维永远在最后.
//! 2. 配置错误 (形状不一致, 空 ROI, 非法超体素个数等) 一律在启动任何后台任务之前同步返回.
//! 3. 后台任务中的错误只会通过任务通道报告一次 (第一个失败者胜出).
//!
//! # 开发计划
//!
//! ### 增强曲线基线归一化 ✅
//!
//! 以前 3 个时间点的均值为基线, 支持减基线和信号增强 (`v / b - 1`) 两种模式.
//!
//! 实现位于 `perf-berry/src/feature/mod.rs`.
//!
//! ### PCA 特征降维 ✅
//!
//! 输入归一化 (percentile / median / indiv / sigenh), 可选时间序列平滑,
//! 协方差矩阵特征分解, 以及各主成分 \[0, 1\] 缩放.
//! 默认使用 `nalgebra`, 打开 `lapack` 特性后改用 `ndarray-linalg`.
//!
//! 实现位于 `perf-berry/src/feature/*`.
//!
//! ### ROI 内的 3D 超体素聚类 (SLIC) ✅
//!
//! 支持规则网格、ROI 内随机、最远点三种种子策略, 以及种子重算.
//! 聚类结束后提取 6-邻域邻接图和边界体素.
//!
//! 实现位于 `perf-berry/src/slic/*`.
//!
//! ### 后台多任务执行 ✅
//!
//! 沿第 0 轴切分数组, 分发给显式持有的线程池, 通过进度通道汇报进度,
//! 最后按 worker 顺序拼接结果.
//!
//! 实现位于 `perf-berry/src/task/*`.
//!
//! ### 处理流程 (Process) ✅
//!
//! 超体素、曲线归一化、PCA、区域均值四种处理流程.
//! 批处理和交互调用共用同一套参数.
//!
//! 实现位于 `perf-berry/src/process/*`.
//!
//! ### 连通性强制 ⌛️
//!
//! 超体素目前不保证空间连通. 后续可以在聚类后合并过小的不连通碎片.

#[cfg(all(feature = "lapack", target_os = "macos", target_arch = "aarch64"))]
extern crate blas_src;

/// 三维索引 `(x, y, z)`, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

/// 三维浮点坐标 `(x, y, z)`.
type Idx3dF = [f64; 3];

/// 4D/3D nii 文件基础数据结构.
mod data;

pub use data::{
    Affine, BoundingBox, Grid, GridAttr, LabelVolume, PerfVolume, RoiMask, VolumeError,
};

pub mod consts;

mod filter;

pub mod feature;

pub mod slic;

pub mod task;

pub mod process;

pub mod prelude;
