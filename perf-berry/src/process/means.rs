//! 区域均值流程.

use std::collections::BTreeMap;

use ndarray::{s, Array1, Array4, Axis};

use super::ProcessResult;
use crate::consts::label;
use crate::{GridAttr, LabelVolume, PerfVolume, VolumeError};

/// 区域均值流程: 每个体素的值替换为它所在标签区域的均值 (4D 数据逐时间点计算).
/// 背景体素输出 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanValuesProcess;

impl MeanValuesProcess {
    /// 计算区域均值.
    pub fn run(volume: &PerfVolume, labels: &LabelVolume) -> ProcessResult<PerfVolume> {
        let shape = volume.spatial_shape();
        if labels.spatial_shape() != shape {
            return Err(VolumeError::ShapeMismatch { roi: labels.spatial_shape(), data: shape }.into());
        }
        let nt = volume.nvols();
        let data = volume.data();

        let mut sums: BTreeMap<u32, (usize, Array1<f64>)> = BTreeMap::new();
        for (pos, &l) in labels.data().indexed_iter() {
            if label::is_background(l) {
                continue;
            }
            let (n, sum) = sums.entry(l).or_insert_with(|| (0, Array1::zeros(nt)));
            *n += 1;
            let (x, y, z) = pos;
            sum.zip_mut_with(&data.slice(s![x, y, z, ..]), |s, v| *s += *v as f64);
        }
        let means: BTreeMap<u32, Array1<f32>> = sums
            .into_iter()
            .map(|(l, (n, sum))| (l, sum.mapv(|s| (s / n as f64) as f32)))
            .collect();
        log::debug!("区域均值: {} 个区域, {nt} 个时间点", means.len());

        let mut out = Array4::zeros(volume.data().raw_dim());
        for (l, mut curve) in labels.data().iter().zip(out.lanes_mut(Axis(3))) {
            if let Some(m) = means.get(l) {
                curve.assign(m);
            }
        }
        Ok(volume.with_data(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Grid;
    use ndarray::Array3;

    #[test]
    fn test_region_means() {
        let data = Array4::from_shape_fn((4, 2, 1, 2), |(x, y, _, t)| (x * 10 + y + t * 100) as f32);
        let v = PerfVolume::new(data, Grid::unit());
        // x = 0, 1 为区域 1, x = 2 为区域 2, x = 3 为背景.
        let labels = LabelVolume::new(
            Array3::from_shape_fn((4, 2, 1), |(x, _, _)| match x {
                0 | 1 => 1,
                2 => 2,
                _ => 0,
            }),
            Grid::unit(),
        );
        let out = MeanValuesProcess::run(&v, &labels).unwrap();
        // 区域 1: (0 + 1 + 10 + 11) / 4 = 5.5.
        assert_eq!(out[(0, 0, 0, 0)], 5.5);
        assert_eq!(out[(1, 1, 0, 0)], 5.5);
        assert_eq!(out[(1, 1, 0, 1)], 105.5);
        assert_eq!(out[(2, 0, 0, 0)], 20.5);
        assert_eq!(out[(3, 1, 0, 1)], 0.0);
    }

    #[test]
    fn test_shape_mismatch() {
        let v = PerfVolume::new(Array4::zeros((2, 2, 2, 1)), Grid::unit());
        let labels = LabelVolume::new(Array3::ones((2, 2, 3)), Grid::unit());
        assert!(MeanValuesProcess::run(&v, &labels).is_err());
    }
}
