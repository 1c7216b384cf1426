//! 超体素邻接图与边界提取.

use std::path::Path;

use image::ImageResult;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3};

use crate::consts::label;

/// 超体素邻接图. 内部保存 `N x N` 的共享面计数矩阵.
///
/// 标签 `l` (`1..=N`) 对应矩阵下标 `l - 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdjacencyGraph {
    faces: Array2<u32>,
}

/// 六邻域中的 "正向" 偏移. 每对相邻体素只访问一次.
const FORWARD: [(usize, usize, usize); 3] = [(1, 0, 0), (0, 1, 0), (0, 0, 1)];

impl AdjacencyGraph {
    /// 从标签数据中提取邻接图. 超体素个数取最大标签值.
    pub fn from_labels(labels: ArrayView3<u32>) -> Self {
        let n = labels.iter().copied().max().unwrap_or(0) as usize;
        let mut faces = Array2::zeros((n, n));
        for_each_contact(labels, |_, _, a, b| {
            let (i, j) = (a as usize - 1, b as usize - 1);
            faces[(i, j)] += 1;
            faces[(j, i)] += 1;
        });
        Self { faces }
    }

    /// 超体素个数.
    #[inline]
    pub fn n_segments(&self) -> usize {
        self.faces.nrows()
    }

    /// 标签 `a` 与 `b` 的共享面个数. 标签越界时返回 0.
    #[inline]
    pub fn shared_faces(&self, a: u32, b: u32) -> u32 {
        match (a.checked_sub(1), b.checked_sub(1)) {
            (Some(i), Some(j)) => self.faces.get((i as usize, j as usize)).copied().unwrap_or(0),
            _ => 0,
        }
    }

    /// 标签 `a` 与 `b` 是否相邻?
    #[inline]
    pub fn is_adjacent(&self, a: u32, b: u32) -> bool {
        self.shared_faces(a, b) > 0
    }

    /// 与标签 `l` 相邻的所有标签, 升序.
    pub fn neighbours(&self, l: u32) -> Vec<u32> {
        (1..=self.n_segments() as u32)
            .filter(|m| self.is_adjacent(l, *m))
            .collect()
    }

    /// 邻接边个数 (无向).
    pub fn edge_count(&self) -> usize {
        self.faces
            .indexed_iter()
            .filter(|((i, j), f)| i < j && **f > 0)
            .count()
    }

    /// 共享面计数矩阵.
    #[inline]
    pub fn face_matrix(&self) -> ArrayView2<'_, u32> {
        self.faces.view()
    }

    /// 布尔邻接矩阵.
    #[inline]
    pub fn to_bool_matrix(&self) -> Array2<bool> {
        self.faces.mapv(|f| f > 0)
    }
}

/// 对每对标签不同且都非零的六邻域相邻体素调用 `op(p, q, label_p, label_q)`.
fn for_each_contact<F>(labels: ArrayView3<u32>, mut op: F)
where
    F: FnMut((usize, usize, usize), (usize, usize, usize), u32, u32),
{
    for (p, &a) in labels.indexed_iter() {
        if label::is_background(a) {
            continue;
        }
        for (dx, dy, dz) in FORWARD {
            let q = (p.0 + dx, p.1 + dy, p.2 + dz);
            match labels.get(q) {
                Some(&b) if label::is_segment(b) && b != a => op(p, q, a, b),
                _ => {}
            }
        }
    }
}

/// 边界体素: 六邻域中存在另一个非零标签的体素.
pub fn border_map(labels: ArrayView3<u32>) -> Array3<bool> {
    let mut border = Array3::from_elem(labels.dim(), false);
    for_each_contact(labels, |p, q, _, _| {
        border[p] = true;
        border[q] = true;
    });
    border
}

/// 将边界图第 `z` 层保存为灰度图像: 边界为白色, 其余为黑色.
///
/// 当 `z` 越界时 panic.
pub fn border_slice_png<P: AsRef<Path>>(border: ArrayView3<bool>, z: usize, path: P) -> ImageResult<()> {
    let (width, height, _) = border.dim();
    let mut buf = image::GrayImage::new(width as u32, height as u32);
    for ((x, y), &b) in border.index_axis(ndarray::Axis(2), z).indexed_iter() {
        buf.put_pixel(x as u32, y as u32, image::Luma([if b { u8::MAX } else { 0 }]));
    }
    buf.save(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 三块沿 x 排列的标签: 1 | 2 | 3, 外加一层背景.
    fn stripes() -> Array3<u32> {
        Array3::from_shape_fn((7, 2, 2), |(x, _, _)| match x {
            0..=1 => 1,
            2..=3 => 2,
            4..=5 => 3,
            _ => 0,
        })
    }

    #[test]
    fn test_adjacency() {
        let labels = stripes();
        let g = AdjacencyGraph::from_labels(labels.view());
        assert_eq!(g.n_segments(), 3);
        assert!(g.is_adjacent(1, 2));
        assert!(g.is_adjacent(2, 3));
        assert!(!g.is_adjacent(1, 3));
        assert_eq!(g.shared_faces(1, 2), 4);
        assert_eq!(g.neighbours(2), vec![1, 3]);
        assert_eq!(g.edge_count(), 2);
        // 背景不参与邻接.
        assert_eq!(g.shared_faces(0, 3), 0);
    }

    #[test]
    fn test_adjacency_symmetric() {
        let labels = Array3::from_shape_fn((5, 5, 5), |(x, y, z)| ((x / 2) * 3 + (y / 3) + (z % 2) * 5) as u32 % 7);
        let g = AdjacencyGraph::from_labels(labels.view());
        let m = g.face_matrix();
        assert_eq!(m, m.t());
        assert_eq!(g.to_bool_matrix(), g.to_bool_matrix().t());
    }

    #[test]
    fn test_border_map() {
        let border = border_map(stripes().view());
        assert!(border[(1, 0, 0)] && border[(2, 0, 0)]);
        assert!(!border[(0, 0, 0)]);
        // 与背景相邻不算边界.
        assert!(!border[(5, 1, 1)] && !border[(6, 1, 1)]);
    }

    #[test]
    fn test_border_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("border.png");
        let border = border_map(stripes().view());
        border_slice_png(border.view(), 1, &path).unwrap();
        let img = image::open(&path).unwrap().to_luma8();
        assert_eq!(img.dimensions(), (7, 2));
        assert_eq!(img.get_pixel(1, 0).0, [255]);
        assert_eq!(img.get_pixel(0, 0).0, [0]);
    }
}
