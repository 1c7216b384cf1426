//! 常用类型一次性导入.
//!
//! ```ignore
//! use perf_berry::prelude::*;
//! ```

pub use crate::feature::{BaselineMode, FeatureError, FeatureVolume, NormType, PcaOptions};
pub use crate::process::{
    CurveNormaliseOptions, CurveNormaliseProcess, MeanValuesOptions, MeanValuesProcess, PcaProcess,
    PcaProcessOptions, ProcessError, ProcessResult, SupervoxelOptions, SupervoxelProcess,
    SupervoxelReport,
};
pub use crate::slic::{AdjacencyGraph, ClusterError, SeedPolicy, SlicParams};
pub use crate::task::{
    NullSink, ProgressSink, TaskError, TaskHandle, TaskOutcome, TaskStatus, WorkerPool,
};
pub use crate::{BoundingBox, Grid, GridAttr, Idx3d, LabelVolume, PerfVolume, RoiMask, VolumeError};
