//! 后台任务的运行时错误.

use thiserror::Error;

/// 后台任务失败原因. 一次任务只会报告第一个失败.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// worker 的计算函数返回了错误.
    #[error("worker {worker} 执行失败: {message}")]
    WorkerFailed {
        /// worker 编号.
        worker: usize,
        /// 错误信息.
        message: String,
    },

    /// worker 的计算函数 panic.
    #[error("worker {worker} panic: {message}")]
    WorkerPanicked {
        /// worker 编号.
        worker: usize,
        /// panic 信息.
        message: String,
    },

    /// 所有 worker 结束前结果通道已关闭.
    #[error("worker 结果通道意外关闭")]
    Disconnected,

    /// 调用者取消了任务.
    #[error("任务已取消")]
    Cancelled,

    /// 无法启动监视线程.
    #[error("无法启动监视线程: {0}")]
    Spawn(String),

    /// 各 worker 的结果无法合并.
    #[error("结果合并失败: {0}")]
    Recombine(String),
}

/// 后台任务结果.
pub type TaskResult<T> = Result<T, TaskError>;
