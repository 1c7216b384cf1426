//! ROI 掩码与包围盒.

use std::ops::Index;
use std::path::Path;

use ndarray::{s, Array3, Array4, ArrayView3, ArrayView4, ArrayViewMut3, Axis, Ix3};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};

use super::VolumeError;
use crate::consts::label;
use crate::Idx3d;

/// 3D 布尔掩码. `true` 代表活动体素 (ROI 内部).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoiMask {
    data: Array3<bool>,
}

impl Index<Idx3d> for RoiMask {
    type Output = bool;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl RoiMask {
    /// 由裸数据创建.
    #[inline]
    pub fn new(data: Array3<bool>) -> Self {
        Self { data }
    }

    /// 形状为 `shape` 且所有体素均为活动体素的掩码.
    #[inline]
    pub fn full(shape: Idx3d) -> Self {
        Self::new(Array3::from_elem(shape, true))
    }

    /// 使用谓词 `f` 逐体素生成掩码.
    #[inline]
    pub fn from_fn<F: FnMut(Idx3d) -> bool>(shape: Idx3d, f: F) -> Self {
        Self::new(Array3::from_shape_fn(shape, f))
    }

    /// 由标签数据创建, 非零标签为活动体素.
    #[inline]
    pub fn from_labels(labels: ArrayView3<'_, u32>) -> Self {
        Self::new(labels.mapv(label::is_segment))
    }

    /// 以 `center` 为球心, `radius` 为半径 (单位: 体素) 的实心球.
    pub fn sphere(shape: Idx3d, center: [f64; 3], radius: f64) -> Self {
        let r2 = radius * radius;
        Self::from_fn(shape, |(x, y, z)| {
            let d = [x as f64 - center[0], y as f64 - center[1], z as f64 - center[2]];
            d.iter().map(|v| v * v).sum::<f64>() <= r2
        })
    }

    /// 打开 nii 文件格式的 3D ROI. 非零体素为活动体素.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, VolumeError> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let data = obj.into_volume().into_ndarray::<f32>()?;
        let data = match data.ndim() {
            3 => data,
            4 if data.len_of(Axis(3)) == 1 => data.index_axis_move(Axis(3), 0),
            n => return Err(VolumeError::Dimensionality(n)),
        };
        let data = data.into_dimensionality::<Ix3>()?.mapv(|v| v != 0.0);
        Ok(Self::new(data.as_standard_layout().into_owned()))
    }

    /// 空间形状.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.data.dim()
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, bool> {
        self.data.view()
    }

    /// 活动体素个数.
    #[inline]
    pub fn count(&self) -> usize {
        self.data.iter().filter(|p| **p).count()
    }

    /// 是否不含任何活动体素?
    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.data.iter().any(|p| *p)
    }

    /// 检查索引是否合法.
    #[inline]
    pub fn check(&self, (x0, y0, z0): &Idx3d) -> bool {
        let (x, y, z) = self.shape();
        *x0 < x && *y0 < y && *z0 < z
    }

    /// 获取 `pos` 处的值. 越界时返回 `false`.
    #[inline]
    pub fn get(&self, pos: Idx3d) -> bool {
        self.data.get(pos).copied().unwrap_or(false)
    }

    /// 收集所有活动体素对应的下标. 结果按行优先存储.
    pub fn positions(&self) -> Vec<Idx3d> {
        self.data
            .indexed_iter()
            .filter_map(|(pos, p)| p.then_some(pos))
            .collect()
    }

    /// 所有活动体素的最小包围盒. ROI 为空时返回 `None`.
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let mut it = self.data.indexed_iter().filter(|(_, p)| **p).map(|(pos, _)| pos);
        let first = it.next()?;
        let (mut lo, mut hi) = (first, first);
        for (x, y, z) in it {
            lo = (lo.0.min(x), lo.1.min(y), lo.2.min(z));
            hi = (hi.0.max(x), hi.1.max(y), hi.2.max(z));
        }
        Some(BoundingBox {
            min: lo,
            max: (hi.0 + 1, hi.1 + 1, hi.2 + 1),
        })
    }

    /// 裁剪到包围盒 `bbox` 内.
    #[inline]
    pub fn crop(&self, bbox: &BoundingBox) -> Self {
        Self::new(bbox.crop_3d(self.data.view()))
    }

    /// 获取 `pos` 前后上下左右六个点的坐标.
    ///
    /// 在数据范围外的坐标会被过滤掉, 不会包含在返回值中.
    pub fn diamond_neighbours(&self, (x, y, z): Idx3d) -> Vec<Idx3d> {
        self.check_collect([
            (x.wrapping_sub(1), y, z),
            (x.saturating_add(1), y, z),
            (x, y.wrapping_sub(1), z),
            (x, y.saturating_add(1), z),
            (x, y, z.wrapping_sub(1)),
            (x, y, z.saturating_add(1)),
        ])
    }

    /// 活动体素 `pos` 是否位于 ROI 边缘 (六邻域中存在非活动体素或越界)?
    pub fn is_edge(&self, pos: Idx3d) -> bool {
        let (x, y, z) = pos;
        self.get(pos)
            && [
                (x.wrapping_sub(1), y, z),
                (x.saturating_add(1), y, z),
                (x, y.wrapping_sub(1), z),
                (x, y.saturating_add(1), z),
                (x, y, z.wrapping_sub(1)),
                (x, y, z.saturating_add(1)),
            ]
            .into_iter()
            .any(|p| !self.get(p))
    }

    /// 收集 `data` 中不越界的索引.
    #[inline]
    fn check_collect<B: FromIterator<Idx3d>, const N: usize>(&self, data: [Idx3d; N]) -> B {
        data.into_iter().filter(|p| self.check(p)).collect()
    }
}

/// 轴对齐包围盒. `min` 包含, `max` 不包含.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundingBox {
    /// 起始下标 (包含).
    pub min: Idx3d,
    /// 结束下标 (不包含).
    pub max: Idx3d,
}

impl BoundingBox {
    /// 包围盒形状.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        (
            self.max.0 - self.min.0,
            self.max.1 - self.min.1,
            self.max.2 - self.min.2,
        )
    }

    /// 全局下标 `pos` 是否在包围盒内?
    #[inline]
    pub fn contains(&self, (x, y, z): Idx3d) -> bool {
        (self.min.0..self.max.0).contains(&x)
            && (self.min.1..self.max.1).contains(&y)
            && (self.min.2..self.max.2).contains(&z)
    }

    /// 将包围盒内的局部下标转换为全局下标.
    #[inline]
    pub fn to_global(&self, (x, y, z): Idx3d) -> Idx3d {
        (x + self.min.0, y + self.min.1, z + self.min.2)
    }

    /// 裁剪 3D 数据.
    ///
    /// 当包围盒越界时 panic.
    pub fn crop_3d<A: Clone>(&self, data: ArrayView3<'_, A>) -> Array3<A> {
        data.slice(s![
            self.min.0..self.max.0,
            self.min.1..self.max.1,
            self.min.2..self.max.2
        ])
        .to_owned()
    }

    /// 裁剪 4D 数据的前三维, 保留最后一维.
    ///
    /// 当包围盒越界时 panic.
    pub fn crop_4d<A: Clone>(&self, data: ArrayView4<'_, A>) -> Array4<A> {
        data.slice(s![
            self.min.0..self.max.0,
            self.min.1..self.max.1,
            self.min.2..self.max.2,
            ..
        ])
        .to_owned()
    }

    /// 将局部数据 `local` 写回全局数据 `dst` 的包围盒区域.
    ///
    /// 当 `local` 形状与包围盒不一致时 panic.
    pub fn paste_3d<A: Clone>(&self, mut dst: ArrayViewMut3<'_, A>, local: ArrayView3<'_, A>) {
        assert_eq!(local.dim(), self.shape(), "局部数据与包围盒形状不一致");
        dst.slice_mut(s![
            self.min.0..self.max.0,
            self.min.1..self.max.1,
            self.min.2..self.max.2
        ])
        .assign(&local);
    }
}
