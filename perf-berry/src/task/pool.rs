//! 显式持有的 worker 线程池.

use threadpool::ThreadPool;

/// worker 线程池.
///
/// 由调用者创建后传给各处理流程, 不存在全局共享的池.
/// 用完后调用 [`WorkerPool::shutdown`] 等待所有线程上的任务结束.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    pool: ThreadPool,
}

impl WorkerPool {
    /// 创建 `n` 个线程的池. `n` 为 0 时按 1 处理.
    pub fn new(n: usize) -> Self {
        let pool = threadpool::Builder::new()
            .num_threads(n.max(1))
            .thread_name("perf-berry-worker".into())
            .build();
        log::debug!("创建 worker 线程池, 线程数 {}", pool.max_count());
        Self { pool }
    }

    /// 线程数等于逻辑核心数的池.
    pub fn with_cpus() -> Self {
        Self::new(num_cpus::get())
    }

    /// 线程数.
    #[inline]
    pub fn size(&self) -> usize {
        self.pool.max_count()
    }

    /// 正在执行的任务数.
    #[inline]
    pub fn active(&self) -> usize {
        self.pool.active_count()
    }

    /// 排队中的任务数.
    #[inline]
    pub fn queued(&self) -> usize {
        self.pool.queued_count()
    }

    pub(crate) fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
        self.pool.execute(job);
    }

    /// 等待所有已提交的任务结束, 然后释放线程池.
    ///
    /// # 注意
    ///
    /// 被取消的任务的 worker 仍会运行到结束, 这里也会等待它们.
    pub fn shutdown(self) {
        self.pool.join();
        log::debug!("worker 线程池已关闭");
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::with_cpus()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_pool() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);

        let pool = WorkerPool::new(3);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = Arc::clone(&counter);
            pool.execute(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        let observer = pool.clone();
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(observer.active(), 0);
        assert_eq!(observer.queued(), 0);
    }
}
