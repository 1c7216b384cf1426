use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Index, IndexMut};
use std::path::Path;

use ndarray::{Array3, Array4, ArrayView1, ArrayView3, ArrayView4, Axis, Ix3, Ix4};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use thiserror::Error;

use crate::consts::label;
use crate::Idx3d;

mod mask;

pub use mask::{BoundingBox, RoiMask};

/// `NiftiHeader` 是栈上大对象, 移动该对象的开销很可观.
/// 因此我们将其分配到堆上.
type BoxedHeader = Box<NiftiHeader>;

/// 4x4 仿射矩阵, 行优先.
pub type Affine = [[f64; 4]; 4];

/// 读写 / 构造体素数据时的错误.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// nifti 底层读写错误.
    #[error("nifti 读写错误: {0}")]
    Nifti(#[from] nifti::NiftiError),

    /// 数据维数既不是 3 也不是 4.
    #[error("不支持的数据维数: {0}")]
    Dimensionality(usize),

    /// ndarray 形状转换错误.
    #[error("数据形状错误: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// ROI 与数据空间形状不一致.
    #[error("ROI 形状 {roi:?} 与数据空间形状 {data:?} 不一致")]
    ShapeMismatch {
        /// ROI 形状.
        roi: Idx3d,
        /// 数据前三维形状.
        data: Idx3d,
    },
}

/// 体素网格元信息: 体素分辨率, 仿射矩阵, 以及 (可选的) 原始 nifti header.
///
/// 保存结果时, 原始 header 会被当作参考 header 使用.
#[derive(Debug, Clone)]
pub struct Grid {
    spacing: [f64; 3],
    affine: Affine,
    header: Option<BoxedHeader>,
}

impl Grid {
    /// 以体素分辨率 `spacing` (单位: 毫米) 构建网格. 仿射矩阵仅包含缩放.
    ///
    /// 若分辨率非正或非有限值, 则程序 panic.
    pub fn new(spacing: [f64; 3]) -> Self {
        assert!(
            spacing.iter().all(|s| s.is_finite() && *s > 0.0),
            "体素分辨率必须为正数"
        );
        let [sx, sy, sz] = spacing;
        Self {
            spacing,
            affine: [
                [sx, 0.0, 0.0, 0.0],
                [0.0, sy, 0.0, 0.0],
                [0.0, 0.0, sz, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
            header: None,
        }
    }

    /// 各向同性的单位网格.
    #[inline]
    pub fn unit() -> Self {
        Self::new([1.0; 3])
    }

    /// 从 nifti header 读取网格信息.
    ///
    /// 仿射矩阵依次尝试 sform, qform, 最后退化为 pixdim 缩放.
    pub fn from_header(h: &NiftiHeader) -> Self {
        let [_, px, py, pz, ..] = h.pixdim;
        let spacing = [px, py, pz].map(|p| match p.abs() as f64 {
            p if p > 0.0 && p.is_finite() => p,
            _ => 1.0,
        });
        Self {
            spacing,
            affine: affine_from_header(h, spacing),
            header: Some(Box::new(h.clone())),
        }
    }

    /// 体素分辨率 `[x, y, z]`, 单位: 毫米.
    #[inline]
    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    /// 以第一维分辨率为单位归一化后的体素分辨率.
    #[inline]
    pub fn normalised_spacing(&self) -> [f64; 3] {
        let s0 = self.spacing[0];
        self.spacing.map(|s| s / s0)
    }

    /// 仿射矩阵.
    #[inline]
    pub fn affine(&self) -> &Affine {
        &self.affine
    }

    /// 原始 nifti header (如果有).
    #[inline]
    pub fn header(&self) -> Option<&NiftiHeader> {
        self.header.as_deref()
    }

    /// 保存时使用的参考 header. 没有原始 header 时, 由分辨率和仿射矩阵合成.
    pub fn to_header(&self) -> NiftiHeader {
        if let Some(h) = self.header() {
            return h.clone();
        }
        let [sx, sy, sz] = self.spacing.map(|s| s as f32);
        let row = |r: &[f64; 4]| r.map(|v| v as f32);
        NiftiHeader {
            pixdim: [1.0, sx, sy, sz, 1.0, 1.0, 1.0, 1.0],
            sform_code: 1,
            srow_x: row(&self.affine[0]),
            srow_y: row(&self.affine[1]),
            srow_z: row(&self.affine[2]),
            ..Default::default()
        }
    }
}

impl Default for Grid {
    fn default() -> Self {
        Self::unit()
    }
}

/// 从 nifti header 计算仿射矩阵.
fn affine_from_header(h: &NiftiHeader, spacing: [f64; 3]) -> Affine {
    if h.sform_code > 0 {
        let row = |r: [f32; 4]| r.map(|v| v as f64);
        return [
            row(h.srow_x),
            row(h.srow_y),
            row(h.srow_z),
            [0.0, 0.0, 0.0, 1.0],
        ];
    }
    let [dx, dy, dz] = spacing;
    if h.qform_code > 0 {
        let (b, c, d) = (
            h.quatern_b as f64,
            h.quatern_c as f64,
            h.quatern_d as f64,
        );
        let a = (1.0 - (b * b + c * c + d * d).min(1.0)).sqrt();
        let qfac = if h.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let dz = dz * qfac;
        let (qx, qy, qz) = (
            h.quatern_x as f64,
            h.quatern_y as f64,
            h.quatern_z as f64,
        );
        return [
            [
                (a * a + b * b - c * c - d * d) * dx,
                (2.0 * b * c - 2.0 * a * d) * dy,
                (2.0 * b * d + 2.0 * a * c) * dz,
                qx,
            ],
            [
                (2.0 * b * c + 2.0 * a * d) * dx,
                (a * a + c * c - b * b - d * d) * dy,
                (2.0 * c * d - 2.0 * a * b) * dz,
                qy,
            ],
            [
                (2.0 * b * d - 2.0 * a * c) * dx,
                (2.0 * c * d + 2.0 * a * b) * dy,
                (a * a + d * d - c * c - b * b) * dz,
                qz,
            ],
            [0.0, 0.0, 0.0, 1.0],
        ];
    }
    Grid::new(spacing).affine
}

/// 体素数据的网格共用属性和部分通用操作.
pub trait GridAttr {
    /// 获取网格元信息.
    fn grid(&self) -> &Grid;

    /// 获取空间形状 `(x, y, z)`.
    fn spatial_shape(&self) -> Idx3d;

    /// 获取空间体素个数.
    #[inline]
    fn n_voxels(&self) -> usize {
        let (x, y, z) = self.spatial_shape();
        x * y * z
    }

    /// 检查空间索引是否合法.
    #[inline]
    fn check(&self, (x0, y0, z0): &Idx3d) -> bool {
        let (x, y, z) = self.spatial_shape();
        *x0 < x && *y0 < y && *z0 < z
    }

    /// 获取单个体素分辨率 `[x, y, z]`, 以毫米为单位.
    #[inline]
    fn spacing(&self) -> [f64; 3] {
        self.grid().spacing()
    }
}

/// 读取 nifti 文件, 返回 `(x, y, z, t)` 标准内存布局的数据以及网格信息.
/// 3D 文件的时间维长度为 1.
fn read_4d<P: AsRef<Path>>(path: P) -> Result<(Array4<f32>, Grid), VolumeError> {
    let obj = ReaderOptions::new().read_file(path.as_ref())?;
    let grid = Grid::from_header(obj.header());
    let data = obj.into_volume().into_ndarray::<f32>()?;
    let data = match data.ndim() {
        3 => data.insert_axis(Axis(3)),
        4 => data,
        n => return Err(VolumeError::Dimensionality(n)),
    };
    // nifti 数据天然是列优先的.
    let data = data
        .into_dimensionality::<Ix4>()?
        .as_standard_layout()
        .into_owned();
    Ok((data, grid))
}

/// 4D 灌注数据 (也可以是只有一个时间点的 3D 数据). 体素值以 `f32` 保存.
///
/// 数据组织为 `(x, y, z, t)`.
#[derive(Debug, Clone)]
pub struct PerfVolume {
    data: Array4<f32>,
    grid: Grid,
}

impl GridAttr for PerfVolume {
    #[inline]
    fn grid(&self) -> &Grid {
        &self.grid
    }

    #[inline]
    fn spatial_shape(&self) -> Idx3d {
        let (x, y, z, _) = self.data.dim();
        (x, y, z)
    }
}

impl Index<(usize, usize, usize, usize)> for PerfVolume {
    type Output = f32;

    #[inline]
    fn index(&self, index: (usize, usize, usize, usize)) -> &Self::Output {
        &self.data[index]
    }
}

impl PerfVolume {
    /// 打开 nii 文件格式的 3D/4D 数据. 如果打开成功, 则返回 `Ok(Self)`, 否则返回 `Err`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, VolumeError> {
        let (data, grid) = read_4d(path)?;
        Ok(Self { data, grid })
    }

    /// 由裸数据直接创建.
    #[inline]
    pub fn new(data: Array4<f32>, grid: Grid) -> Self {
        Self { data, grid }
    }

    /// 由 3D 裸数据创建只有一个时间点的数据.
    #[inline]
    pub fn from_3d(data: Array3<f32>, grid: Grid) -> Self {
        Self::new(data.insert_axis(Axis(3)), grid)
    }

    /// 时间点个数.
    #[inline]
    pub fn nvols(&self) -> usize {
        self.data.len_of(Axis(3))
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    /// 消费自我, 获得底层数据.
    #[inline]
    pub fn into_data(self) -> Array4<f32> {
        self.data
    }

    /// 获取第 `t` 个时间点的 3D 视图.
    ///
    /// 当 `t` 越界时 panic.
    #[inline]
    pub fn volume_at(&self, t: usize) -> ArrayView3<'_, f32> {
        self.data.index_axis(Axis(3), t)
    }

    /// 获取 `(x, y, z)` 体素的时间曲线.
    ///
    /// 当索引越界时 panic.
    #[inline]
    pub fn curve_at(&self, (x, y, z): Idx3d) -> ArrayView1<'_, f32> {
        self.data.slice(ndarray::s![x, y, z, ..])
    }

    /// 以同样的网格信息包装新数据.
    ///
    /// 新数据的空间形状必须与自身一致, 否则程序 panic.
    pub fn with_data(&self, data: Array4<f32>) -> Self {
        let (x, y, z, _) = data.dim();
        assert_eq!((x, y, z), self.spatial_shape(), "新数据空间形状不一致");
        Self::new(data, self.grid.clone())
    }

    /// 以 nifti 格式保存. 网格信息 (原始 header 或合成的 header) 作为参考 header 写入.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), VolumeError> {
        let header = self.grid.to_header();
        let opts = WriterOptions::new(path.as_ref()).reference_header(&header);
        if self.nvols() == 1 {
            opts.write_nifti(&self.volume_at(0))?;
        } else {
            opts.write_nifti(&self.data)?;
        }
        Ok(())
    }
}

/// 3D 标签数据 (超体素 / ROI 区域). 标签值以 `u32` 保存, 0 代表背景.
#[derive(Debug, Clone)]
pub struct LabelVolume {
    data: Array3<u32>,
    grid: Grid,
    regions: BTreeSet<u32>,
}

impl GridAttr for LabelVolume {
    #[inline]
    fn grid(&self) -> &Grid {
        &self.grid
    }

    #[inline]
    fn spatial_shape(&self) -> Idx3d {
        self.data.dim()
    }
}

impl Index<Idx3d> for LabelVolume {
    type Output = u32;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl IndexMut<Idx3d> for LabelVolume {
    #[inline]
    fn index_mut(&mut self, index: Idx3d) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl LabelVolume {
    /// 由裸标签数据创建. 区域集合会被立即统计.
    pub fn new(data: Array3<u32>, grid: Grid) -> Self {
        let regions = data.iter().copied().filter(|l| label::is_segment(*l)).collect();
        Self {
            data,
            grid,
            regions,
        }
    }

    /// 打开 nii 文件格式的 3D 标签.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, VolumeError> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let grid = Grid::from_header(obj.header());
        let data = obj.into_volume().into_ndarray::<f32>()?;
        let data = match data.ndim() {
            3 => data,
            4 if data.len_of(Axis(3)) == 1 => data.index_axis_move(Axis(3), 0),
            n => return Err(VolumeError::Dimensionality(n)),
        };
        let data = data
            .into_dimensionality::<Ix3>()?
            .mapv(|v| if v > 0.0 { v.round() as u32 } else { 0 })
            .as_standard_layout()
            .into_owned();
        Ok(Self::new(data, grid))
    }

    /// 以 nifti 格式保存. 网格信息 (原始 header 或合成的 header) 作为参考 header 写入.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), VolumeError> {
        let header = self.grid.to_header();
        let opts = WriterOptions::new(path.as_ref()).reference_header(&header);
        opts.write_nifti(&self.data)?;
        Ok(())
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, u32> {
        self.data.view()
    }

    /// 消费自我, 获得底层数据.
    #[inline]
    pub fn into_data(self) -> Array3<u32> {
        self.data
    }

    /// 所有非零标签值, 升序.
    #[inline]
    pub fn regions(&self) -> &BTreeSet<u32> {
        &self.regions
    }

    /// 获取标签值为 `l` 的体素个数.
    #[inline]
    pub fn count(&self, l: u32) -> usize {
        self.data.iter().filter(|p| **p == l).count()
    }

    /// 统计每个非零标签的体素个数.
    pub fn region_sizes(&self) -> BTreeMap<u32, usize> {
        let mut ans = BTreeMap::new();
        for l in self.data.iter().copied().filter(|l| label::is_segment(*l)) {
            *ans.entry(l).or_insert(0) += 1;
        }
        ans
    }

    /// 所有非零体素构成的 ROI.
    #[inline]
    pub fn to_mask(&self) -> RoiMask {
        RoiMask::from_labels(self.data.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn test_grid_normalised_spacing() {
        let g = Grid::new([2.0, 2.0, 5.0]);
        assert_eq!(g.normalised_spacing(), [1.0, 1.0, 2.5]);
        assert_eq!(g.affine()[2][2], 5.0);
        assert!(g.header().is_none());
    }

    #[test]
    #[should_panic]
    fn test_grid_invalid_spacing() {
        Grid::new([1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_label_volume_regions() {
        let mut data = Array3::<u32>::zeros((3, 3, 3));
        data[(0, 0, 0)] = 2;
        data[(1, 1, 1)] = 2;
        data[(2, 2, 2)] = 5;
        let lv = LabelVolume::new(data, Grid::unit());
        assert_eq!(lv.regions().iter().copied().collect::<Vec<_>>(), vec![2, 5]);
        assert_eq!(lv.region_sizes()[&2], 2);
        assert_eq!(lv.count(0), 24);
        assert_eq!(lv.to_mask().count(), 3);
    }

    #[test]
    fn test_perf_volume_curve() {
        let data = Array::from_shape_fn((2, 3, 4, 5), |(x, y, z, t)| {
            (x * 1000 + y * 100 + z * 10 + t) as f32
        });
        let v = PerfVolume::new(data, Grid::unit());
        assert_eq!(v.spatial_shape(), (2, 3, 4));
        assert_eq!(v.nvols(), 5);
        assert_eq!(v.n_voxels(), 24);
        assert!(v.check(&(1, 2, 3)));
        assert!(!v.check(&(2, 0, 0)));
        assert_eq!(v.curve_at((1, 2, 3)).to_vec(), vec![1230.0, 1231.0, 1232.0, 1233.0, 1234.0]);
        assert_eq!(v.volume_at(4)[(1, 0, 0)], 1004.0);
        assert_eq!(v[(1, 2, 3, 4)], 1234.0);
    }

    /// 写入后再读回, 空间对应关系不变.
    #[test]
    fn test_nifti_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.nii");

        let data = Array::from_shape_fn((4, 5, 6), |(x, y, z)| (x + 2 * y + 3 * z) as u32 % 7);
        let lv = LabelVolume::new(data.clone(), Grid::new([1.0, 1.0, 2.0]));
        lv.save(&path).unwrap();

        let back = LabelVolume::open(&path).unwrap();
        assert_eq!(back.spatial_shape(), (4, 5, 6));
        assert_eq!(back.data(), data.view());
        assert_eq!(back.spacing(), [1.0, 1.0, 2.0]);
    }
}
