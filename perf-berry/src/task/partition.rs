//! 参数切分与结果合并.

use std::collections::BTreeMap;

use ndarray::{concatenate, Array, ArrayView, Axis, Dimension, RemoveAxis, Slice};

use super::error::{TaskError, TaskResult};

/// 可以分发给 `n` 个 worker 的参数.
///
/// 数组沿第 0 轴切成连续的块, 其余参数用 [`Broadcast`] 包装后原样复制给每个 worker.
pub trait Partition {
    /// 单个 worker 拿到的部分.
    type Part: Send + 'static;

    /// 切成恰好 `n` 份 (`n >= 1`).
    fn partition(self, n: usize) -> Vec<Self::Part>;
}

/// 第 `i` 块 (共 `n` 块) 在长度为 `len` 的轴上的范围.
///
/// 前 `len % n` 块各多一行.
pub fn chunk_range(len: usize, n: usize, i: usize) -> std::ops::Range<usize> {
    let (base, extra) = (len / n, len % n);
    let start = i * base + i.min(extra);
    let size = base + usize::from(i < extra);
    start..start + size
}

/// 沿第 0 轴切出第 `i` 块的视图.
pub fn chunk_view<'a, A, D: Dimension>(a: &'a Array<A, D>, n: usize, i: usize) -> ArrayView<'a, A, D> {
    let r = chunk_range(a.len_of(Axis(0)), n, i);
    a.slice_axis(Axis(0), Slice::from(r))
}

impl<A, D> Partition for Array<A, D>
where
    A: Clone + Send + 'static,
    D: Dimension + 'static,
{
    type Part = Array<A, D>;

    fn partition(self, n: usize) -> Vec<Self::Part> {
        let n = n.max(1);
        (0..n).map(|i| chunk_view(&self, n, i).to_owned()).collect()
    }
}

/// 广播参数: 每个 worker 都拿到一份克隆.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Broadcast<T>(pub T);

impl<T: Clone + Send + 'static> Partition for Broadcast<T> {
    type Part = T;

    fn partition(self, n: usize) -> Vec<T> {
        vec![self.0; n.max(1)]
    }
}

impl Partition for () {
    type Part = ();

    fn partition(self, n: usize) -> Vec<()> {
        vec![(); n.max(1)]
    }
}

macro_rules! impl_partition_tuple {
    ($($name: ident $var: ident),+) => {
        impl<$($name: Partition),+> Partition for ($($name,)+) {
            type Part = ($($name::Part,)+);

            fn partition(self, n: usize) -> Vec<Self::Part> {
                let ($($var,)+) = self;
                $(let mut $var = $var.partition(n).into_iter();)+
                (0..n.max(1))
                    .map_while(|_| Some(($($var.next()?,)+)))
                    .collect()
            }
        }
    };
}

impl_partition_tuple!(P0 p0);
impl_partition_tuple!(P0 p0, P1 p1);
impl_partition_tuple!(P0 p0, P1 p1, P2 p2);
impl_partition_tuple!(P0 p0, P1 p1, P2 p2, P3 p3);

/// 可以按 worker 顺序合并的结果.
pub trait Recombine: Sized + Send + 'static {
    /// 合并后的结果.
    type Output: Send + 'static;

    /// 按 worker 编号顺序合并.
    fn recombine(parts: Vec<Self>) -> TaskResult<Self::Output>;
}

impl<A, D> Recombine for Array<A, D>
where
    A: Clone + Send + 'static,
    D: RemoveAxis + 'static,
{
    type Output = Array<A, D>;

    fn recombine(parts: Vec<Self>) -> TaskResult<Self::Output> {
        let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
        concatenate(Axis(0), &views).map_err(|e| TaskError::Recombine(e.to_string()))
    }
}

/// 按名字分别合并每一个输出.
impl<A, D> Recombine for BTreeMap<String, Array<A, D>>
where
    A: Clone + Send + 'static,
    D: RemoveAxis + 'static,
{
    type Output = BTreeMap<String, Array<A, D>>;

    fn recombine(parts: Vec<Self>) -> TaskResult<Self::Output> {
        let mut grouped: BTreeMap<String, Vec<Array<A, D>>> = BTreeMap::new();
        let n = parts.len();
        for part in parts {
            for (name, arr) in part {
                grouped.entry(name).or_default().push(arr);
            }
        }
        grouped
            .into_iter()
            .map(|(name, arrs)| {
                if arrs.len() != n {
                    return Err(TaskError::Recombine(format!(
                        "输出 `{name}` 只在 {} / {n} 个 worker 中出现",
                        arrs.len()
                    )));
                }
                Ok((name, Array::recombine(arrs)?))
            })
            .collect()
    }
}

/// 单 worker 任务的结果, 原样传出.
#[derive(Debug, Clone, PartialEq)]
pub struct Single<T>(pub T);

impl<T: Send + 'static> Recombine for Single<T> {
    type Output = T;

    fn recombine(parts: Vec<Self>) -> TaskResult<T> {
        let n = parts.len();
        match <[Single<T>; 1]>::try_from(parts) {
            Ok([Single(t)]) => Ok(t),
            Err(_) => Err(TaskError::Recombine(format!(
                "单 worker 任务得到了 {n} 份结果"
            ))),
        }
    }
}

impl Recombine for () {
    type Output = ();

    fn recombine(_: Vec<()>) -> TaskResult<()> {
        Ok(())
    }
}
