//! PCA 降维流程.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2};
use ndarray_npy::NpzWriter;

use super::{PcaProcessOptions, ProcessError, ProcessResult};
use crate::feature;
use crate::{GridAttr, PerfVolume, RoiMask, VolumeError};

/// PCA 流程的结果.
#[derive(Debug, Clone)]
pub struct PcaReport {
    /// 每个主成分一个 3D 数据, 名为 `<output-name><i>` (`i` 从 0 开始).
    pub outputs: Vec<(String, PerfVolume)>,

    /// 各主成分解释方差比例.
    pub explained_variance: Vec<f64>,

    /// 各主成分的模式曲线 (主成分 + 均值), 形状 `(k, t)`.
    pub modes: Array2<f64>,

    /// 均值曲线.
    pub mean: Array1<f64>,
}

impl PcaReport {
    /// 在 `dir` 下将每个主成分保存为 `<name>.nii.gz`, 模式曲线与解释方差保存为 `<output-name>_modes.npz`.
    pub fn save_all<P: AsRef<Path>>(&self, dir: P, output_name: &str) -> ProcessResult<Vec<PathBuf>> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let mut files = Vec::with_capacity(self.outputs.len() + 1);
        for (name, v) in &self.outputs {
            let path = dir.join(format!("{name}.nii.gz"));
            v.save(&path)?;
            files.push(path);
        }
        let path = dir.join(format!("{output_name}_modes.npz"));
        let mut npz = NpzWriter::new(File::create(&path)?);
        npz.add_array("modes.npy", &self.modes)?;
        npz.add_array("mean.npy", &self.mean)?;
        npz.add_array("explained_variance.npy", &Array1::from(self.explained_variance.clone()))?;
        npz.finish()?;
        files.push(path);
        Ok(files)
    }
}

/// PCA 降维流程. 同步执行.
#[derive(Debug, Clone, Copy, Default)]
pub struct PcaProcess;

impl PcaProcess {
    /// 对 ROI 内 (无 ROI 时为全部) 体素做 PCA.
    ///
    /// # 返回值
    ///
    /// 输入不是 4D 数据时返回 `Err(ProcessError::NotTimeSeries)`;
    /// 主成分个数不小于时间点个数时返回 `Err(ProcessError::TooManyComponents)`.
    pub fn run(volume: &PerfVolume, roi: Option<&RoiMask>, opts: &PcaProcessOptions) -> ProcessResult<PcaReport> {
        let nvols = volume.nvols();
        if nvols == 1 {
            return Err(ProcessError::NotTimeSeries(nvols));
        }
        if opts.n_components >= nvols {
            return Err(ProcessError::TooManyComponents { requested: opts.n_components, nvols });
        }
        if let Some(m) = roi {
            if m.shape() != volume.spatial_shape() {
                return Err(VolumeError::ShapeMismatch { roi: m.shape(), data: volume.spatial_shape() }.into());
            }
        }

        let r = feature::reduce(volume.data(), roi, &opts.pca_options())?;
        log::info!("PCA 流程: 解释方差 {:?}", r.explained_variance);
        let outputs = (0..r.features.n_features())
            .map(|c| {
                let data = r.features.feature_at(c).mapv(|v| v as f32);
                (
                    format!("{}{c}", opts.output_name),
                    PerfVolume::from_3d(data, volume.grid().clone()),
                )
            })
            .collect();
        Ok(PcaReport {
            outputs,
            modes: r.modes(),
            mean: r.mean().to_owned(),
            explained_variance: r.explained_variance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::NormType;
    use crate::Grid;
    use ndarray::Array4;

    fn volume() -> PerfVolume {
        let data = Array4::from_shape_fn((6, 5, 4, 8), |(x, y, _, t)| {
            100.0 + (x as f32 + 1.0) * (t as f32) + (y as f32) * (t as f32).sqrt()
        });
        PerfVolume::new(data, Grid::new([1.5, 1.5, 3.0]))
    }

    #[test]
    fn test_pca_process() {
        let opts = PcaProcessOptions { n_components: 3, ..Default::default() };
        assert_eq!(opts.norm_type, NormType::SigEnh);
        let roi = RoiMask::from_fn((6, 5, 4), |(x, _, _)| x > 0);
        let r = PcaProcess::run(&volume(), Some(&roi), &opts).unwrap();
        assert_eq!(r.outputs.len(), 3);
        assert_eq!(r.outputs[0].0, "pca0");
        assert_eq!(r.outputs[2].0, "pca2");
        assert_eq!(r.outputs[1].1.spatial_shape(), (6, 5, 4));
        assert_eq!(r.outputs[1].1.nvols(), 1);
        assert_eq!(r.modes.dim(), (3, 8));
        assert_eq!(r.mean.len(), 8);
        assert!(r.explained_variance.windows(2).all(|w| w[0] >= w[1]));
        // ROI 外特征为 0.
        assert_eq!(r.outputs[0].1[(0, 2, 2, 0)], 0.0);

        let dir = tempfile::tempdir().unwrap();
        let files = r.save_all(dir.path(), "pca").unwrap();
        assert_eq!(files.len(), 4);
        assert!(files.iter().all(|f| f.exists()));

        let mut npz = ndarray_npy::NpzReader::new(File::open(&files[3]).unwrap()).unwrap();
        let modes: Array2<f64> = npz.by_name("modes.npy").unwrap();
        assert_eq!(modes, r.modes);
        let mean: Array1<f64> = npz.by_name("mean.npy").unwrap();
        assert_eq!(mean.len(), 8);
        let ev: Array1<f64> = npz.by_name("explained_variance.npy").unwrap();
        assert_eq!(ev.to_vec(), r.explained_variance);
    }

    #[test]
    fn test_pca_process_errors() {
        let v = volume();
        let opts = PcaProcessOptions { n_components: 8, ..Default::default() };
        assert!(matches!(
            PcaProcess::run(&v, None, &opts),
            Err(ProcessError::TooManyComponents { requested: 8, nvols: 8 })
        ));

        let single = PerfVolume::from_3d(v.volume_at(0).to_owned(), Grid::unit());
        assert!(matches!(
            PcaProcess::run(&single, None, &PcaProcessOptions::default()),
            Err(ProcessError::NotTimeSeries(1))
        ));
    }
}
