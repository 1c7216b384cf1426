//! 超体素流程: 曲线归一化 -> PCA -> ROI 内 SLIC.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ndarray::{Array1, Array3, Array4, Axis};
use ndarray_npy::NpzWriter;

use super::{ProcessResult, SupervoxelOptions};
use crate::consts::{BASELINE_POINTS, POLL_INTERVAL};
use crate::feature::{self, BaselineMode, FeatureError, PcaOptions};
use crate::slic::{self, AdjacencyGraph, ClusterError, ClusterOutput, SlicParams};
use crate::task::{Broadcast, NullSink, ProcessLog, ProgressSender, ProgressSink, Single, TaskHandle, TaskRunner, WorkerPool};
use crate::{BoundingBox, GridAttr, LabelVolume, PerfVolume, RoiMask, VolumeError};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use crate::feature::par_normalize_curves as normalize_curves;
    } else {
        use crate::feature::normalize_curves;
    }
}

/// 超体素流程的结果. 所有数组都是完整网格大小.
#[derive(Debug, Clone)]
pub struct SupervoxelReport {
    /// 超体素标签, ROI 外为 0.
    pub labels: LabelVolume,

    /// 邻接图.
    pub adjacency: AdjacencyGraph,

    /// 边界体素.
    pub border: Array3<bool>,

    /// 最终超体素个数.
    pub n_segments: usize,

    /// 被停用的种子个数.
    pub deactivated: usize,

    /// 主循环迭代次数.
    pub iterations: usize,

    /// 是否在最大迭代次数之前收敛.
    pub converged: bool,

    /// 各主成分解释方差比例. 3D 输入时为空.
    pub explained_variance: Vec<f64>,

    /// 处理日志.
    pub log: String,
}

impl SupervoxelReport {
    /// 边界体素最多的 z 层. 并列时取最小的 z.
    pub fn border_slice(&self) -> usize {
        self.border
            .axis_iter(Axis(2))
            .enumerate()
            .rev()
            .max_by_key(|(_, s)| s.iter().filter(|b| **b).count())
            .map_or(0, |(z, _)| z)
    }

    /// 保存 `.npz` 归档: `labels`, `border`, `adjacency`, `shared_faces`, `explained_variance`.
    /// 成员名带 `.npy` 后缀, 与 `numpy.savez` 的写法一致.
    pub fn save_npz<P: AsRef<Path>>(&self, path: P) -> ProcessResult<()> {
        let mut npz = NpzWriter::new(File::create(path)?);
        npz.add_array("labels.npy", &self.labels.data())?;
        npz.add_array("border.npy", &self.border)?;
        npz.add_array("adjacency.npy", &self.adjacency.to_bool_matrix())?;
        npz.add_array("shared_faces.npy", &self.adjacency.face_matrix())?;
        npz.add_array(
            "explained_variance.npy",
            &Array1::from(self.explained_variance.clone()),
        )?;
        npz.finish()?;
        Ok(())
    }

    /// 将 [`Self::border_slice`] 层的边界保存为 png.
    pub fn save_border_png<P: AsRef<Path>>(&self, path: P) -> ProcessResult<()> {
        slic::border_slice_png(self.border.view(), self.border_slice(), path)?;
        Ok(())
    }

    /// 在 `dir` 下保存 `<name>.nii.gz`, `<name>.npz`, `<name>_border.png` 以及 `logfile`.
    ///
    /// # 返回值
    ///
    /// 按上述顺序返回写入的文件路径.
    pub fn save_all<P: AsRef<Path>>(&self, dir: P, name: &str) -> ProcessResult<Vec<PathBuf>> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let nii = dir.join(format!("{name}.nii.gz"));
        self.labels.save(&nii)?;
        let npz = dir.join(format!("{name}.npz"));
        self.save_npz(&npz)?;
        let png = dir.join(format!("{name}_border.png"));
        self.save_border_png(&png)?;
        let logfile = dir.join("logfile");
        fs::write(&logfile, &self.log)?;
        Ok(vec![nii, npz, png, logfile])
    }
}

/// 交给 worker 的全部输入, 已裁剪到 ROI 包围盒.
#[derive(Debug, Clone)]
struct Job {
    data: Array4<f32>,
    mask: RoiMask,
    spacing: [f64; 3],
    params: SlicParams,
    pca: Option<PcaOptions>,
}

/// worker 的输出, 仍位于包围盒坐标系下.
struct Clustered {
    out: ClusterOutput,
    explained: Vec<f64>,
}

/// 超体素流程.
///
/// 4D 数据先做基线归一化和 PCA 降维; 单时间点数据直接将强度缩放到 \[0, 1\] 作为特征.
/// 计算只在 ROI 包围盒内进行, 结果再写回完整网格.
#[derive(Debug, Clone)]
pub struct SupervoxelProcess<'p> {
    pool: &'p WorkerPool,
    poll_interval: Duration,
}

impl<'p> SupervoxelProcess<'p> {
    /// 使用 `pool` 中的线程执行.
    pub fn new(pool: &'p WorkerPool) -> Self {
        Self { pool, poll_interval: POLL_INTERVAL }
    }

    /// 进度轮询周期.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// 启动后台任务并立即返回句柄.
    ///
    /// # 返回值
    ///
    /// 配置错误 (ROI 形状不一致, 空 ROI, 非法超体素个数, 主成分个数非法等) 直接返回 `Err`,
    /// 此时不会启动任何 worker.
    pub fn run<S>(
        &self,
        volume: &PerfVolume,
        roi: &RoiMask,
        opts: &SupervoxelOptions,
        sink: S,
    ) -> ProcessResult<TaskHandle<SupervoxelReport>>
    where
        S: ProgressSink<SupervoxelReport> + 'static,
    {
        let (job, bbox) = prepare(volume, roi, opts)?;
        let shape = volume.spatial_shape();
        let grid = volume.grid().clone();
        log::info!(
            "超体素流程: 数据形状 {:?}, {} 个时间点, 包围盒 {:?}..{:?}",
            shape,
            volume.nvols(),
            bbox.min,
            bbox.max
        );
        let handle = TaskRunner::new(self.pool)
            .name("supervoxels")
            .workers(1)
            .poll_interval(self.poll_interval)
            .start_with(
                Broadcast(job),
                run_job,
                move |c: Clustered, log: &ProcessLog| {
                    let mut labels = Array3::zeros(shape);
                    bbox.paste_3d(labels.view_mut(), c.out.labels.view());
                    let mut border = Array3::from_elem(shape, false);
                    bbox.paste_3d(border.view_mut(), c.out.border.view());
                    Ok(SupervoxelReport {
                        labels: LabelVolume::new(labels, grid),
                        adjacency: c.out.adjacency,
                        border,
                        n_segments: c.out.n_segments,
                        deactivated: c.out.deactivated,
                        iterations: c.out.iterations,
                        converged: c.out.converged,
                        explained_variance: c.explained,
                        log: log.as_str().to_string(),
                    })
                },
                sink,
            );
        Ok(handle)
    }

    /// 同步执行, 阻塞直到完成.
    pub fn run_sync(
        &self,
        volume: &PerfVolume,
        roi: &RoiMask,
        opts: &SupervoxelOptions,
    ) -> ProcessResult<SupervoxelReport> {
        self.run_sync_with(volume, roi, opts, NullSink)
    }

    /// 同步执行, 进度发往 `sink`.
    pub fn run_sync_with<S>(
        &self,
        volume: &PerfVolume,
        roi: &RoiMask,
        opts: &SupervoxelOptions,
        sink: S,
    ) -> ProcessResult<SupervoxelReport>
    where
        S: ProgressSink<SupervoxelReport> + 'static,
    {
        Ok(self.run(volume, roi, opts, sink)?.wait().into_result()?)
    }
}

/// 同步检查全部配置, 并裁剪出包围盒内的输入.
fn prepare(volume: &PerfVolume, roi: &RoiMask, opts: &SupervoxelOptions) -> ProcessResult<(Job, BoundingBox)> {
    let shape = volume.spatial_shape();
    if roi.shape() != shape {
        return Err(VolumeError::ShapeMismatch { roi: roi.shape(), data: shape }.into());
    }
    let bbox = roi.bounding_box().ok_or(ClusterError::InvalidMask)?;
    let active = roi.count();
    let nvols = volume.nvols();

    let pca = (nvols > 1).then(|| opts.pca_options());
    let n_features = match &pca {
        Some(p) => {
            check_pca(p, nvols, active)?;
            p.n_components
        }
        None => 1,
    };

    let params = opts.slic_params(active);
    let mask = roi.crop(&bbox);
    let (bx, by, bz) = bbox.shape();
    slic::validate((bx, by, bz, n_features), volume.spacing(), &mask, &params)?;

    let job = Job {
        data: bbox.crop_4d(volume.data()),
        mask,
        spacing: volume.spacing(),
        params,
        pca,
    };
    Ok((job, bbox))
}

fn check_pca(p: &PcaOptions, nvols: usize, active: usize) -> Result<(), FeatureError> {
    let k = p.n_components;
    if nvols < BASELINE_POINTS {
        return Err(FeatureError::TooFewTimepoints(nvols, BASELINE_POINTS));
    }
    if k == 0 {
        return Err(FeatureError::ZeroComponents);
    }
    if k >= nvols {
        return Err(FeatureError::TooManyComponents { requested: k, timepoints: nvols });
    }
    if active < k {
        return Err(FeatureError::InsufficientData { active, requested: k });
    }
    Ok(())
}

fn run_job(_: usize, progress: &ProgressSender, job: Job) -> ProcessResult<Single<Clustered>> {
    let (bx, by, bz) = job.mask.shape();
    progress.log(format!(
        "ROI 包围盒 {bx}x{by}x{bz}, 活动体素 {}",
        job.mask.count()
    ));

    let (features, explained) = match &job.pca {
        Some(opts) => {
            let curves = normalize_curves(job.data.view(), BaselineMode::Subtract)?;
            let r = feature::reduce(curves.view(), Some(&job.mask), opts)?;
            progress.log(format!(
                "PCA: {} 个主成分, 解释方差 {:?}",
                opts.n_components, r.explained_variance
            ));
            (r.features, r.explained_variance)
        }
        None => {
            progress.log("单时间点数据, 强度缩放到 [0, 1] 作为特征");
            let f = feature::scaled_intensity(job.data.index_axis(Axis(3), 0), Some(&job.mask))?;
            (f, Vec::new())
        }
    };

    let out = slic::cluster_with_progress(&features, job.spacing, &job.mask, &job.params, |done, total| {
        progress.report(done, total)
    })?;
    progress.log(format!(
        "SLIC: {} 个超体素, {} 个种子被停用, {} 次迭代{}",
        out.n_segments,
        out.deactivated,
        out.iterations,
        if out.converged { ", 已收敛" } else { "" }
    ));
    Ok(Single(Clustered { out, explained }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessError;
    use crate::Grid;

    /// 两种曲线: x < 5 的体素快速增强, 其余缓慢增强.
    fn volume() -> PerfVolume {
        let data = Array4::from_shape_fn((10, 8, 6, 12), |(x, _, _, t)| {
            let t = t as f32;
            if x < 5 {
                100.0 + 50.0 * (t - 2.0).max(0.0).min(3.0)
            } else {
                100.0 + 10.0 * (t - 2.0).max(0.0)
            }
        });
        PerfVolume::new(data, Grid::new([1.0, 1.0, 2.0]))
    }

    fn roi() -> RoiMask {
        RoiMask::from_fn((10, 8, 6), |(x, y, z)| (1..9).contains(&x) && (1..7).contains(&y) && z < 5)
    }

    #[test]
    fn test_config_errors() {
        let pool = WorkerPool::new(1);
        let p = SupervoxelProcess::new(&pool);
        let v = volume();
        let opts = SupervoxelOptions { n_supervoxels: Some(4), ..Default::default() };

        let empty = RoiMask::from_fn((10, 8, 6), |_| false);
        assert!(matches!(
            p.run(&v, &empty, &opts, NullSink),
            Err(ProcessError::Cluster(ClusterError::InvalidMask))
        ));

        let wrong = RoiMask::full((10, 8, 5));
        assert!(matches!(
            p.run(&v, &wrong, &opts, NullSink),
            Err(ProcessError::Volume(VolumeError::ShapeMismatch { .. }))
        ));

        let many = SupervoxelOptions { n_supervoxels: Some(1000), ..Default::default() };
        assert!(matches!(
            p.run(&v, &roi(), &many, NullSink),
            Err(ProcessError::Cluster(ClusterError::DegenerateSegmentCount { requested: 1000, .. }))
        ));

        let k = SupervoxelOptions { n_components: 20, ..opts.clone() };
        assert!(matches!(
            p.run(&v, &roi(), &k, NullSink),
            Err(ProcessError::Feature(FeatureError::TooManyComponents { .. }))
        ));
        // 主成分个数必须严格小于时间点个数, 与 PCA 流程一致.
        let k = SupervoxelOptions { n_components: 12, ..opts.clone() };
        assert!(matches!(
            p.run(&v, &roi(), &k, NullSink),
            Err(ProcessError::Feature(FeatureError::TooManyComponents { requested: 12, timepoints: 12 }))
        ));

        // 不足 3 个时间点的 4D 数据无法计算基线.
        let short = PerfVolume::new(Array4::zeros((10, 8, 6, 2)), Grid::unit());
        assert!(matches!(
            p.run(&short, &roi(), &opts, NullSink),
            Err(ProcessError::Feature(FeatureError::TooFewTimepoints(2, 3)))
        ));
        pool.shutdown();
    }

    #[test]
    fn test_labels_in_full_grid() {
        let pool = WorkerPool::new(2);
        let mask = roi();
        let opts = SupervoxelOptions {
            n_supervoxels: Some(4),
            n_components: 2,
            seed_type: slic::SeedPolicy::Grid,
            ..Default::default()
        };
        let report = SupervoxelProcess::new(&pool)
            .poll_interval(Duration::from_millis(5))
            .run_sync(&volume(), &mask, &opts)
            .unwrap();

        assert_eq!(report.labels.spatial_shape(), (10, 8, 6));
        assert_eq!(report.labels.spacing(), [1.0, 1.0, 2.0]);
        for (pos, &l) in report.labels.data().indexed_iter() {
            assert_eq!(l != 0, mask[pos], "{pos:?}");
        }
        assert_eq!(report.labels.regions().len(), report.n_segments);
        assert_eq!(report.explained_variance.len(), 2);
        assert!(report.log.contains("SLIC"));
        // 边界只出现在 ROI 内.
        assert!(report.border.indexed_iter().all(|(pos, b)| !*b || mask[pos]));
        pool.shutdown();
    }

    #[test]
    fn test_single_volume_and_save() {
        let pool = WorkerPool::new(1);
        let data = Array3::from_shape_fn((8, 8, 4), |(x, y, _)| (x + y) as f32);
        let v = PerfVolume::from_3d(data, Grid::unit());
        let mask = RoiMask::full((8, 8, 4));
        let opts = SupervoxelOptions { n_supervoxels: Some(4), ..Default::default() };
        let report = SupervoxelProcess::new(&pool).run_sync(&v, &mask, &opts).unwrap();
        assert!(report.explained_variance.is_empty());
        assert!(report.labels.data().iter().all(|l| *l >= 1));

        let dir = tempfile::tempdir().unwrap();
        let files = report.save_all(dir.path(), "sv").unwrap();
        assert_eq!(files.len(), 4);
        assert!(files.iter().all(|f| f.exists()));
        assert_eq!(files[3].file_name().unwrap(), "logfile");

        let back = LabelVolume::open(&files[0]).unwrap();
        assert_eq!(back.data(), report.labels.data());

        let mut npz = ndarray_npy::NpzReader::new(File::open(&files[1]).unwrap()).unwrap();
        let names = npz.names().unwrap();
        for name in ["labels.npy", "border.npy", "adjacency.npy", "shared_faces.npy", "explained_variance.npy"] {
            assert!(names.iter().any(|n| n == name), "{name}: {names:?}");
        }
        let labels: Array3<u32> = npz.by_name("labels.npy").unwrap();
        assert_eq!(labels, report.labels.data());
        let border: Array3<bool> = npz.by_name("border.npy").unwrap();
        assert_eq!(border, report.border);
        let adj: ndarray::Array2<bool> = npz.by_name("adjacency.npy").unwrap();
        assert_eq!(adj.dim(), (report.n_segments, report.n_segments));
        let faces: ndarray::Array2<u32> = npz.by_name("shared_faces.npy").unwrap();
        assert_eq!(faces, report.adjacency.face_matrix());
        assert_eq!(adj, faces.mapv(|f| f > 0));
        pool.shutdown();
    }
}
