//! 曲线基线归一化流程. 数据沿 x 轴切分给全部 worker.

use std::time::Duration;

use ndarray::{s, Array4, Axis};

use super::{CurveNormaliseOptions, ProcessResult};
use crate::consts::{BASELINE_POINTS, POLL_INTERVAL};
use crate::feature::{normalize_curves, BaselineMode, FeatureError};
use crate::task::{Broadcast, NullSink, ProgressSink, TaskHandle, TaskRunner, WorkerPool};
use crate::{GridAttr, PerfVolume};

/// 曲线基线归一化流程.
#[derive(Debug, Clone)]
pub struct CurveNormaliseProcess<'p> {
    pool: &'p WorkerPool,
    poll_interval: Duration,
}

impl<'p> CurveNormaliseProcess<'p> {
    /// 使用 `pool` 中的全部线程执行.
    pub fn new(pool: &'p WorkerPool) -> Self {
        Self { pool, poll_interval: POLL_INTERVAL }
    }

    /// 进度轮询周期.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// 启动后台任务. 时间点不足 3 个时直接返回 `Err`.
    pub fn run<S>(
        &self,
        volume: &PerfVolume,
        opts: &CurveNormaliseOptions,
        sink: S,
    ) -> ProcessResult<TaskHandle<PerfVolume>>
    where
        S: ProgressSink<PerfVolume> + 'static,
    {
        let nvols = volume.nvols();
        if nvols < BASELINE_POINTS {
            return Err(FeatureError::TooFewTimepoints(nvols, BASELINE_POINTS).into());
        }
        let grid = volume.grid().clone();
        let (nx, _, _) = volume.spatial_shape();
        let handle = TaskRunner::new(self.pool)
            .name("curve-normalise")
            .poll_interval(self.poll_interval)
            .expected_total(nx)
            .start_with(
                (volume.data().to_owned(), Broadcast(opts.mode)),
                |_, progress, (chunk, mode): (Array4<f32>, BaselineMode)| {
                    let n = chunk.len_of(Axis(0));
                    let mut out = Array4::zeros(chunk.raw_dim());
                    for i in 0..n {
                        let slab = normalize_curves(chunk.slice(s![i..=i, .., .., ..]), mode)?;
                        out.slice_mut(s![i..=i, .., .., ..]).assign(&slab);
                        progress.report(i + 1, n);
                    }
                    Ok::<_, FeatureError>(out)
                },
                move |data, _| Ok(PerfVolume::new(data, grid)),
                sink,
            );
        Ok(handle)
    }

    /// 同步执行.
    pub fn run_sync(&self, volume: &PerfVolume, opts: &CurveNormaliseOptions) -> ProcessResult<PerfVolume> {
        self.run_sync_with(volume, opts, NullSink)
    }

    /// 同步执行, 进度发往 `sink`.
    pub fn run_sync_with<S>(&self, volume: &PerfVolume, opts: &CurveNormaliseOptions, sink: S) -> ProcessResult<PerfVolume>
    where
        S: ProgressSink<PerfVolume> + 'static,
    {
        Ok(self.run(volume, opts, sink)?.wait().into_result()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Grid;

    #[test]
    fn test_matches_direct() {
        let data = Array4::from_shape_fn((7, 3, 2, 6), |(x, y, z, t)| {
            (x * 3 + y + z) as f32 + (t * t) as f32 * 0.5
        });
        let v = PerfVolume::new(data.clone(), Grid::new([2.0, 2.0, 3.0]));
        let pool = WorkerPool::new(3);
        let out = CurveNormaliseProcess::new(&pool)
            .poll_interval(Duration::from_millis(1))
            .run_sync(&v, &CurveNormaliseOptions::default())
            .unwrap();
        let direct = normalize_curves(data.view(), BaselineMode::Subtract).unwrap();
        assert_eq!(out.data(), direct);
        assert_eq!(out.spacing(), [2.0, 2.0, 3.0]);

        // 基线 (前 3 个时间点) 的均值为 0.
        let c = out.curve_at((4, 1, 1));
        assert!((c.iter().take(3).sum::<f32>() / 3.0).abs() < 1e-5);
        pool.shutdown();
    }

    #[test]
    fn test_more_workers_than_rows() {
        let data = Array4::from_elem((2, 2, 2, 4), 3.0f32);
        let v = PerfVolume::new(data, Grid::unit());
        let pool = WorkerPool::new(4);
        let opts = CurveNormaliseOptions { mode: BaselineMode::Enhancement, ..Default::default() };
        let out = CurveNormaliseProcess::new(&pool).run_sync(&v, &opts).unwrap();
        assert_eq!(out.data().dim(), (2, 2, 2, 4));
        assert!(out.data().iter().all(|v| v.abs() < 1e-3));
        pool.shutdown();
    }

    #[test]
    fn test_too_few_timepoints() {
        let pool = WorkerPool::new(1);
        let v = PerfVolume::new(Array4::zeros((2, 2, 2, 2)), Grid::unit());
        assert!(CurveNormaliseProcess::new(&pool)
            .run(&v, &CurveNormaliseOptions::default(), NullSink)
            .is_err());
        pool.shutdown();
    }
}
