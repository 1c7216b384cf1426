//! 可分离高斯滤波. 边界使用半采样对称反射 (`d c b a | a b c d | d c b a`).

use ndarray::{Array4, ArrayView1, ArrayViewMut1, Axis, Zip};

use crate::consts::GAUSSIAN_TRUNCATE;

/// 归一化的一维高斯核. 核半径为 `truncate * sigma` 四舍五入.
pub(crate) fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (GAUSSIAN_TRUNCATE * sigma + 0.5) as usize;
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f64> = (0..=2 * radius)
        .map(|i| {
            let x = i as f64 - radius as f64;
            (-x * x / denom).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

/// 将越界下标 `i` 反射回 `[0, n)`.
#[inline]
fn reflect(i: isize, n: usize) -> usize {
    let n = n as isize;
    let period = 2 * n;
    let i = i.rem_euclid(period);
    if i >= n {
        (period - i - 1) as usize
    } else {
        i as usize
    }
}

/// 使用核 `kernel` 对 `src` 做一维卷积, 结果写入 `dst`.
pub(crate) fn convolve_lane(src: ArrayView1<f64>, mut dst: ArrayViewMut1<f64>, kernel: &[f64]) {
    let n = src.len();
    let radius = (kernel.len() / 2) as isize;
    for (i, d) in dst.iter_mut().enumerate() {
        *d = kernel
            .iter()
            .enumerate()
            .map(|(k, w)| w * src[reflect(i as isize + k as isize - radius, n)])
            .sum();
    }
}

/// 对 4D 数据的前三个 (空间) 维度分别做高斯平滑, 最后一维 (特征维) 不平滑.
///
/// `sigmas[a]` 是第 `a` 个空间维的 sigma (单位: 体素). 非正值代表该维不平滑.
pub(crate) fn smooth_spatial(data: &mut Array4<f64>, sigmas: [f64; 3]) {
    for (axis, sigma) in sigmas.into_iter().enumerate() {
        if sigma <= 0.0 || data.len_of(Axis(axis)) < 2 {
            continue;
        }
        let kernel = gaussian_kernel(sigma);
        let src = data.clone();
        let zip = Zip::from(data.lanes_mut(Axis(axis))).and(src.lanes(Axis(axis)));
        #[cfg(feature = "rayon")]
        zip.par_for_each(|dst, src| convolve_lane(src, dst, &kernel));
        #[cfg(not(feature = "rayon"))]
        zip.for_each(|dst, src| convolve_lane(src, dst, &kernel));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array1};

    #[test]
    fn test_kernel_normalised() {
        let k = gaussian_kernel(2.0);
        assert_eq!(k.len(), 17);
        assert!((k.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(k[8] > k[7] && (k[7] - k[9]).abs() < 1e-15);
    }

    #[test]
    fn test_reflect() {
        assert_eq!(reflect(-1, 4), 0);
        assert_eq!(reflect(-2, 4), 1);
        assert_eq!(reflect(4, 4), 3);
        assert_eq!(reflect(5, 4), 2);
        assert_eq!(reflect(3, 1), 0);
    }

    /// 常数序列平滑后不变.
    #[test]
    fn test_constant_lane() {
        let src = arr1(&[3.0; 6]);
        let mut dst = Array1::zeros(6);
        convolve_lane(src.view(), dst.view_mut(), &gaussian_kernel(1.5));
        assert!(dst.iter().all(|v| (v - 3.0).abs() < 1e-12));
    }

    /// 平滑后总和守恒 (反射边界), 且峰值降低.
    #[test]
    fn test_smooth_spatial_keeps_mass() {
        let mut data = Array4::<f64>::zeros((7, 7, 7, 2));
        data[(3, 3, 3, 0)] = 1.0;
        smooth_spatial(&mut data, [1.0, 1.0, 1.0]);
        let c0: f64 = data.index_axis(Axis(3), 0).sum();
        assert!((c0 - 1.0).abs() < 1e-9);
        assert!(data[(3, 3, 3, 0)] < 1.0);
        assert_eq!(data.index_axis(Axis(3), 1).sum(), 0.0);
    }
}
