//! 种子点放置.

use ndarray::{Array3, Axis};
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::{Idx3d, RoiMask};

/// 距离变换中代表 "无穷远" 的大数. 使用有限值以避免 `inf - inf`.
const FAR: f64 = 1e20;

/// 种子放置策略.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum SeedPolicy {
    /// ROI 包围盒内的规则网格, 网格点落在 ROI 外的会被丢弃.
    Grid,

    /// ROI 内均匀随机采样.
    Random,

    /// 依次放在距离 ROI 边缘和已有种子都最远的体素上.
    #[default]
    #[cfg_attr(feature = "serde", serde(alias = "nrandom"))]
    Farthest,
}

/// 两个体素之间的各向异性距离平方.
#[inline]
pub(crate) fn dist2(a: Idx3d, b: Idx3d, spacing: [f64; 3]) -> f64 {
    let d = [
        (a.0 as f64 - b.0 as f64) * spacing[0],
        (a.1 as f64 - b.1 as f64) * spacing[1],
        (a.2 as f64 - b.2 as f64) * spacing[2],
    ];
    d.iter().map(|v| v * v).sum()
}

/// 按照 `policy` 在 `mask` 内放置约 `n` 个种子.
///
/// # 注意
///
/// 规则网格策略得到的种子个数与 `n` 不一定相等. 其余策略恰好返回 `n` 个种子.
/// 调用者需保证 `0 < n <= mask.count()`.
pub(crate) fn place_seeds(
    mask: &RoiMask,
    spacing: [f64; 3],
    n: usize,
    policy: SeedPolicy,
    random_seed: u64,
) -> Vec<Idx3d> {
    match policy {
        SeedPolicy::Grid => grid_seeds(mask, spacing, n),
        SeedPolicy::Random => random_seeds(mask, n, random_seed),
        SeedPolicy::Farthest => farthest_seeds(mask, spacing, n),
    }
}

/// 四舍六入五成双.
#[inline]
fn round_half_even(x: f64) -> f64 {
    let r = x.round();
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        r
    }
}

/// 在形状为 `shape` 的空间中放置约 `n` 个规则网格点, 返回每一维的 `(起点, 步长)`.
///
/// 较薄的维度 (长度小于理想步长) 会被整体当作一个步长, 余下维度重新均分.
pub(crate) fn regular_grid(shape: [usize; 3], n: usize) -> [(usize, usize); 3] {
    let space = shape.iter().product::<usize>() as f64;
    if space <= n as f64 {
        return [(0, 1); 3];
    }
    let mut order = [0, 1, 2];
    order.sort_by_key(|&a| shape[a]);
    let sorted = order.map(|a| shape[a] as f64);

    let mut steps = [(space / n as f64).cbrt(); 3];
    if sorted.iter().zip(&steps).any(|(d, s)| d < s) {
        for dim in 0..3 {
            steps[dim] = sorted[dim];
            let rest = 3 - dim - 1;
            if rest == 0 {
                break;
            }
            let sub: f64 = sorted[dim + 1..].iter().product();
            let s = (sub / n as f64).powf(1.0 / rest as f64);
            steps[dim + 1..].iter_mut().for_each(|st| *st = s);
            if sorted.iter().zip(&steps).all(|(d, s)| d >= s) {
                break;
            }
        }
    }

    let mut ans = [(0, 1); 3];
    for (k, &axis) in order.iter().enumerate() {
        let start = (steps[k] / 2.0).floor() as usize;
        let step = (round_half_even(steps[k]) as usize).max(1);
        ans[axis] = (start, step);
    }
    ans
}

fn grid_seeds(mask: &RoiMask, spacing: [f64; 3], n: usize) -> Vec<Idx3d> {
    let Some(bbox) = mask.bounding_box() else {
        return Vec::new();
    };
    let (sx, sy, sz) = bbox.shape();
    let [(x0, dx), (y0, dy), (z0, dz)] = regular_grid([sx, sy, sz], n);

    let mut points = Vec::new();
    for x in (x0..sx).step_by(dx) {
        for y in (y0..sy).step_by(dy) {
            for z in (z0..sz).step_by(dz) {
                points.push(bbox.to_global((x, y, z)));
            }
        }
    }

    let inside: Vec<Idx3d> = points.iter().copied().filter(|p| mask[*p]).collect();
    if !inside.is_empty() {
        return thin_evenly(inside, n);
    }

    log::debug!("规则网格点全部落在 ROI 外, 吸附到最近的活动体素");
    let positions = mask.positions();
    let mut snapped: Vec<Idx3d> = Vec::with_capacity(points.len());
    for p in points {
        let nearest = positions.iter().copied().fold(None, |best: Option<(Idx3d, f64)>, q| {
            let d = dist2(p, q, spacing);
            match best {
                Some((_, bd)) if bd <= d => best,
                _ => Some((q, d)),
            }
        });
        if let Some((q, _)) = nearest {
            if !snapped.contains(&q) {
                snapped.push(q);
            }
        }
    }
    thin_evenly(snapped, n)
}

/// 点数超过 `n` 时, 按行优先顺序等间隔保留 `n` 个点.
fn thin_evenly(points: Vec<Idx3d>, n: usize) -> Vec<Idx3d> {
    let len = points.len();
    if len <= n {
        return points;
    }
    (0..n).map(|i| points[i * len / n]).collect()
}

fn random_seeds(mask: &RoiMask, n: usize, random_seed: u64) -> Vec<Idx3d> {
    let positions = mask.positions();
    let mut rng = ChaCha8Rng::seed_from_u64(random_seed);
    let mut picked = index::sample(&mut rng, positions.len(), n.min(positions.len())).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| positions[i]).collect()
}

fn farthest_seeds(mask: &RoiMask, spacing: [f64; 3], n: usize) -> Vec<Idx3d> {
    let mut dist = edge_distance2(mask, spacing);
    let positions = mask.positions();
    let mut seeds = Vec::with_capacity(n);
    for _ in 0..n {
        let best = positions.iter().copied().fold(None, |best: Option<(Idx3d, f64)>, p| {
            let d = dist[p];
            match best {
                Some((_, bd)) if bd >= d => best,
                _ => Some((p, d)),
            }
        });
        let Some((seed, d)) = best else { break };
        if d <= 0.0 {
            break;
        }
        seeds.push(seed);
        for &q in &positions {
            let d2 = dist2(seed, q, spacing);
            if d2 < dist[q] {
                dist[q] = d2;
            }
        }
    }
    seeds
}

/// 每个活动体素到最近非活动体素 (数据范围之外也视为非活动) 的各向异性距离平方.
/// 非活动体素为 0.
pub(crate) fn edge_distance2(mask: &RoiMask, spacing: [f64; 3]) -> Array3<f64> {
    let (x, y, z) = mask.shape();
    // 四周各填充一层背景.
    let mut f = Array3::<f64>::zeros((x + 2, y + 2, z + 2));
    for ((i, j, k), &p) in mask.data().indexed_iter() {
        if p {
            f[(i + 1, j + 1, k + 1)] = FAR;
        }
    }
    let mut buf = Vec::new();
    for (axis, s) in spacing.into_iter().enumerate() {
        let w = s * s;
        for mut lane in f.lanes_mut(Axis(axis)) {
            buf.clear();
            buf.extend(lane.iter().copied());
            let out = distance_transform_1d(&buf, w);
            lane.iter_mut().zip(out).for_each(|(dst, v)| *dst = v);
        }
    }
    f.slice(ndarray::s![1..=x, 1..=y, 1..=z]).to_owned()
}

/// 一维平方距离变换 (下包络抛物线): `d(p) = min_q (w (p - q)^2 + f(q))`.
fn distance_transform_1d(f: &[f64], w: f64) -> Vec<f64> {
    let n = f.len();
    if n == 0 {
        return Vec::new();
    }
    let mut v = vec![0usize; n];
    let mut z = vec![0.0f64; n + 1];
    let intersect = |q: usize, p: usize| {
        let (qf, pf) = (q as f64, p as f64);
        ((f[q] + w * qf * qf) - (f[p] + w * pf * pf)) / (2.0 * w * (qf - pf))
    };

    let mut k = 0;
    z[0] = f64::NEG_INFINITY;
    z[1] = f64::INFINITY;
    for q in 1..n {
        let mut s = intersect(q, v[k]);
        while s <= z[k] {
            k -= 1;
            s = intersect(q, v[k]);
        }
        k += 1;
        v[k] = q;
        z[k] = s;
        z[k + 1] = f64::INFINITY;
    }

    let mut d = vec![0.0; n];
    k = 0;
    for (q, dq) in d.iter_mut().enumerate() {
        while z[k + 1] < q as f64 {
            k += 1;
        }
        let diff = q as f64 - v[k] as f64;
        *dq = w * diff * diff + f[v[k]];
    }
    d
}
