//! 聚类迭代.

use ndarray::{Array3, ArrayView4};

use crate::{Idx3d, Idx3dF, RoiMask};

/// 未分配体素的临时标签.
const UNSET: u32 = u32::MAX;

/// 聚类中心: 空间位置 + 特征均值.
#[derive(Debug, Clone, PartialEq)]
pub struct Centroid {
    /// 空间位置 (体素坐标).
    pub pos: Idx3dF,
    /// 特征向量.
    pub feat: Vec<f64>,
    active: bool,
}

impl Centroid {
    /// 中心是否仍然有效?
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// 单次聚类运行的状态.
pub(crate) struct SlicCore<'a> {
    features: ArrayView4<'a, f64>,
    mask: &'a RoiMask,
    /// 以第一维为单位归一化的体素分辨率.
    spacing: [f64; 3],
    centroids: Vec<Centroid>,
    /// 期望超体素边长的平方倒数.
    inv_s2: f64,
    /// 特征项权重 `1 / (c^2 K)`.
    feature_weight: f64,
    /// 每一维的搜索半径 (体素).
    window: [usize; 3],
}

impl<'a> SlicCore<'a> {
    /// 以 `seeds` 初始化聚类中心. 中心特征取种子体素的特征.
    pub fn new(
        features: ArrayView4<'a, f64>,
        mask: &'a RoiMask,
        spacing: [f64; 3],
        seeds: &[Idx3d],
        compactness: f64,
    ) -> Self {
        let active = mask.count().max(1) as f64;
        let step = (active / seeds.len().max(1) as f64).cbrt().max(1.0);
        let k = features.len_of(ndarray::Axis(3)).max(1) as f64;
        let window = spacing.map(|s| (2.0 * step / s).ceil() as usize);
        let centroids = seeds
            .iter()
            .map(|&(x, y, z)| Centroid {
                pos: [x as f64, y as f64, z as f64],
                feat: features.slice(ndarray::s![x, y, z, ..]).to_vec(),
                active: true,
            })
            .collect();
        log::debug!("SLIC: 步长 {step:.3}, 搜索半径 {window:?}");
        Self {
            features,
            mask,
            spacing,
            centroids,
            inv_s2: 1.0 / (step * step),
            feature_weight: 1.0 / (compactness * compactness * k),
            window,
        }
    }

    #[cfg(test)]
    pub fn centroids(&self) -> &[Centroid] {
        &self.centroids
    }

    /// 体素 `p` 与中心 `c` 的综合距离.
    #[inline]
    fn distance(&self, c: &Centroid, (x, y, z): Idx3d, feature_weight: f64) -> f64 {
        let p = [x as f64, y as f64, z as f64];
        let ds: f64 = (0..3)
            .map(|a| {
                let d = (p[a] - c.pos[a]) * self.spacing[a];
                d * d
            })
            .sum();
        if feature_weight == 0.0 {
            return ds * self.inv_s2;
        }
        let df: f64 = self
            .features
            .slice(ndarray::s![x, y, z, ..])
            .iter()
            .zip(&c.feat)
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        ds * self.inv_s2 + df * feature_weight
    }

    /// 在各中心的搜索窗口内分配标签. 标签为中心下标, 未覆盖的体素为 `UNSET`.
    ///
    /// 中心按下标升序处理且只在距离严格更小时才覆盖, 因此距离相等时下标较小者胜出.
    fn assign(&self, feature_weight: f64) -> Array3<u32> {
        let shape = self.mask.shape();
        let dims = [shape.0, shape.1, shape.2];
        let mut labels = Array3::from_elem(shape, UNSET);
        let mut dist = Array3::from_elem(shape, f64::INFINITY);

        for (ci, c) in self.centroids.iter().enumerate().filter(|(_, c)| c.active) {
            let [(x0, x1), (y0, y1), (z0, z1)] = [0, 1, 2].map(|a| {
                let centre = c.pos[a].round().max(0.0) as usize;
                (
                    centre.saturating_sub(self.window[a]),
                    (centre + self.window[a] + 1).min(dims[a]),
                )
            });
            for x in x0..x1 {
                for y in y0..y1 {
                    for z in z0..z1 {
                        let p = (x, y, z);
                        if !self.mask[p] {
                            continue;
                        }
                        let d = self.distance(c, p, feature_weight);
                        if d < dist[p] {
                            dist[p] = d;
                            labels[p] = ci as u32;
                        }
                    }
                }
            }
        }
        labels
    }

    /// 以成员均值更新中心. 没有成员的中心会被停用.
    fn update(&mut self, labels: &Array3<u32>) {
        let k = self.features.len_of(ndarray::Axis(3));
        let n = self.centroids.len();
        let mut counts = vec![0usize; n];
        let mut pos_sum = vec![[0.0f64; 3]; n];
        let mut feat_sum = vec![vec![0.0f64; k]; n];

        for ((x, y, z), &l) in labels.indexed_iter() {
            if l == UNSET {
                continue;
            }
            let l = l as usize;
            counts[l] += 1;
            pos_sum[l][0] += x as f64;
            pos_sum[l][1] += y as f64;
            pos_sum[l][2] += z as f64;
            let f = self.features.slice(ndarray::s![x, y, z, ..]);
            feat_sum[l].iter_mut().zip(f.iter()).for_each(|(s, v)| *s += v);
        }

        for (i, c) in self.centroids.iter_mut().enumerate() {
            if !c.active {
                continue;
            }
            if counts[i] == 0 {
                log::debug!("SLIC: 中心 {i} 没有成员, 停用");
                c.active = false;
                continue;
            }
            let cnt = counts[i] as f64;
            c.pos = pos_sum[i].map(|s| s / cnt);
            c.feat = feat_sum[i].iter().map(|s| s / cnt).collect();
        }
    }

    /// 迭代至多 `max_iter` 次, 直到标签不再变化.
    ///
    /// `spatial_only` 为 `true` 时忽略特征项 (用于种子重算).
    /// 每完成一次迭代调用一次 `on_iter`.
    ///
    /// # 返回值
    ///
    /// `(最后一次分配的标签, 迭代次数, 是否收敛)`.
    pub fn run<F: FnMut()>(
        &mut self,
        max_iter: usize,
        spatial_only: bool,
        mut on_iter: F,
    ) -> (Array3<u32>, usize, bool) {
        let weight = if spatial_only {
            0.0
        } else {
            self.feature_weight
        };
        let mut prev: Option<Array3<u32>> = None;
        let mut iterations = 0;
        let mut converged = false;
        for _ in 0..max_iter.max(1) {
            let labels = self.assign(weight);
            iterations += 1;
            let same = prev.as_ref().map_or(false, |p| *p == labels);
            self.update(&labels);
            prev = Some(labels);
            on_iter();
            if same {
                converged = true;
                break;
            }
        }
        let labels = prev.unwrap_or_else(|| self.assign(weight));
        (labels, iterations, converged)
    }

    /// 将未被任何搜索窗口覆盖的活动体素分配给全局最近的有效中心.
    ///
    /// 返回补分配的体素个数.
    pub fn fill_unreached(&self, labels: &mut Array3<u32>) -> usize {
        let mut filled = 0;
        for p in self.mask.positions() {
            if labels[p] != UNSET {
                continue;
            }
            let nearest = self
                .centroids
                .iter()
                .enumerate()
                .filter(|(_, c)| c.active)
                .fold(None, |best: Option<(usize, f64)>, (i, c)| {
                    let d = self.distance(c, p, self.feature_weight);
                    match best {
                        Some((_, bd)) if bd <= d => best,
                        _ => Some((i, d)),
                    }
                });
            if let Some((i, _)) = nearest {
                labels[p] = i as u32;
                filled += 1;
            }
        }
        filled
    }

    /// 将中心下标标签重编号为 `1..=N` (按种子下标升序), 背景为 0.
    ///
    /// 返回 `(新标签, 保留下来的中心)`.
    pub fn renumber(&self, labels: &Array3<u32>) -> (Array3<u32>, Vec<Centroid>) {
        let n = self.centroids.len();
        let mut used = vec![false; n];
        labels
            .iter()
            .filter(|l| **l != UNSET)
            .for_each(|l| used[*l as usize] = true);

        let mut mapping = vec![0u32; n];
        let mut kept = Vec::new();
        for (i, c) in self.centroids.iter().enumerate() {
            if used[i] {
                kept.push(c.clone());
                mapping[i] = kept.len() as u32;
            }
        }
        let out = labels.mapv(|l| if l == UNSET { 0 } else { mapping[l as usize] });
        (out, kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    /// 两块特征截然不同的区域, 每块一个种子.
    fn two_blocks() -> (Array4<f64>, RoiMask) {
        let f = Array4::from_shape_fn((8, 4, 4, 1), |(x, _, _, _)| if x < 4 { 0.0 } else { 1.0 });
        (f, RoiMask::full((8, 4, 4)))
    }

    #[test]
    fn test_two_blocks_separate() {
        let (f, mask) = two_blocks();
        let mut core = SlicCore::new(f.view(), &mask, [1.0; 3], &[(1, 1, 1), (6, 2, 2)], 0.1);
        let (mut labels, iterations, converged) = core.run(10, false, || {});
        assert!(converged);
        assert!(iterations >= 2);
        assert_eq!(core.fill_unreached(&mut labels), 0);
        let (labels, kept) = core.renumber(&labels);
        assert_eq!(kept.len(), 2);
        for ((x, _, _), &l) in labels.indexed_iter() {
            assert_eq!(l, if x < 4 { 1 } else { 2 });
        }
    }

    /// 距离相等时下标较小的中心胜出.
    #[test]
    fn test_tie_break_lower_index() {
        let f = Array4::<f64>::zeros((3, 1, 1, 1));
        let mask = RoiMask::full((3, 1, 1));
        let core = SlicCore::new(f.view(), &mask, [1.0; 3], &[(0, 0, 0), (2, 0, 0)], 1.0);
        let labels = core.assign(core.feature_weight);
        assert_eq!(labels[(1, 0, 0)], 0);
        assert_eq!(labels[(2, 0, 0)], 1);
    }

    /// 重复的种子中, 后一个没有成员, 会被停用并在重编号时去除.
    #[test]
    fn test_duplicate_seed_deactivated() {
        let (f, mask) = two_blocks();
        let mut core = SlicCore::new(f.view(), &mask, [1.0; 3], &[(1, 1, 1), (1, 1, 1), (6, 2, 2)], 0.1);
        let (labels, _, _) = core.run(10, false, || {});
        assert!(!core.centroids()[1].is_active());
        let (labels, kept) = core.renumber(&labels);
        assert_eq!(kept.len(), 2);
        assert_eq!(labels.iter().copied().max(), Some(2));
    }

    /// 极小的搜索窗口覆盖不到的体素, 会被补分配.
    #[test]
    fn test_fill_unreached() {
        let f = Array4::<f64>::zeros((20, 1, 1, 1));
        let mask = RoiMask::full((20, 1, 1));
        // 步长为 20^(1/3) ~= 2.7, 搜索半径 6.
        let core = SlicCore::new(f.view(), &mask, [1.0; 3], &[(0, 0, 0)], 1.0);
        let mut labels = core.assign(core.feature_weight);
        assert_eq!(labels[(19, 0, 0)], UNSET);
        let filled = core.fill_unreached(&mut labels);
        assert_eq!(filled, 13);
        assert!(labels.iter().all(|l| *l == 0));
    }
}
