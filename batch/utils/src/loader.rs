//! 对 `perf-berry` 数据读取的一层封装. 负责数据路径的查找.

use perf_berry::{LabelVolume, PerfVolume, RoiMask, VolumeError};
use std::env;
use std::path::{Path, PathBuf};

/// 覆盖数据根目录的环境变量.
pub const DATA_DIR_ENV: &str = "PERF_BERRY_DATA_DIR";

/// 获取数据根目录.
///
/// 1. 若环境变量 `$PERF_BERRY_DATA_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset`;
/// 3. 无法确定家目录时返回 `None`.
pub fn data_dir_from_env_or_home() -> Option<PathBuf> {
    match env::var(DATA_DIR_ENV) {
        Ok(d) if !d.is_empty() => Some(PathBuf::from(d)),
        _ => dirs::home_dir().map(|h| h.join("dataset")),
    }
}

/// 解析输入文件路径.
///
/// 绝对路径原样返回. 相对路径依次尝试 `base` (通常为批处理文件所在目录) 和数据根目录,
/// 返回第一个存在的路径; 都不存在时返回基于 `base` 的路径, 让随后的读取报告错误.
pub fn resolve_input<P: AsRef<Path>, B: AsRef<Path>>(path: P, base: B) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let local = base.as_ref().join(path);
    if local.exists() {
        return local;
    }
    data_dir_from_env_or_home()
        .map(|d| d.join(path))
        .filter(|p| p.exists())
        .unwrap_or(local)
}

/// 读取 4D (或 3D) 灌注数据.
#[inline]
pub fn open_volume<P: AsRef<Path>>(path: P) -> Result<PerfVolume, VolumeError> {
    log::debug!("读取数据 {}", path.as_ref().display());
    PerfVolume::open(path)
}

/// 读取 ROI. 任何非零体素都视为 ROI 内部.
#[inline]
pub fn open_roi<P: AsRef<Path>>(path: P) -> Result<RoiMask, VolumeError> {
    log::debug!("读取 ROI {}", path.as_ref().display());
    RoiMask::open(path)
}

/// 读取标签数据.
#[inline]
pub fn open_labels<P: AsRef<Path>>(path: P) -> Result<LabelVolume, VolumeError> {
    log::debug!("读取标签 {}", path.as_ref().display());
    LabelVolume::open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_input() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.nii.gz");
        std::fs::write(&file, b"").unwrap();

        assert_eq!(resolve_input("data.nii.gz", dir.path()), file);
        assert_eq!(resolve_input(&file, "/nonexistent"), file);
        // 不存在时退回到基于 `base` 的路径.
        let missing = resolve_input("missing-4f1c.nii.gz", dir.path());
        assert_eq!(missing, dir.path().join("missing-4f1c.nii.gz"));
    }
}
