//! 进度通道, 进度汇总与处理日志.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::consts::MAX_LOG_SIZE;

/// worker 发出的进度消息: 第 `worker_id` 个 worker 已完成 `voxel_index / total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressMessage {
    /// worker 编号.
    pub worker_id: usize,
    /// 已完成的工作量.
    pub voxel_index: usize,
    /// 该 worker 的总工作量.
    pub total: usize,
}

/// worker 发往监视线程的事件.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkerEvent {
    Progress(ProgressMessage),
    Log(String),
}

/// 交给 worker 的进度通道句柄.
///
/// 接收端关闭 (任务被取消或已失败) 后, 发送会被静默丢弃.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    worker_id: usize,
    tx: Sender<WorkerEvent>,
    cancelled: Arc<AtomicBool>,
}

impl ProgressSender {
    pub(crate) fn new(worker_id: usize, tx: Sender<WorkerEvent>, cancelled: Arc<AtomicBool>) -> Self {
        Self { worker_id, tx, cancelled }
    }

    /// worker 编号.
    #[inline]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// 汇报进度.
    pub fn report(&self, voxel_index: usize, total: usize) {
        let msg = ProgressMessage { worker_id: self.worker_id, voxel_index, total };
        let _ = self.tx.send(WorkerEvent::Progress(msg));
    }

    /// 向处理日志追加一行.
    pub fn log<S: Into<String>>(&self, line: S) {
        let _ = self.tx.send(WorkerEvent::Log(line.into()));
    }

    /// 调用者是否已经取消任务? worker 可以据此提前退出, 但这不是必须的.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// 汇总各 worker 的进度.
///
/// 每个 worker 只保留最后一次汇报的值, 因此消息乱序或重复都不影响结果.
/// 返回的比例被限制在 \[0, 1\] 且单调不减.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    done: Vec<usize>,
    totals: Vec<usize>,
    expected_total: Option<usize>,
    fraction: f64,
}

impl ProgressTracker {
    /// 创建 `n_workers` 个 worker 的汇总器.
    ///
    /// `expected_total` 为全部 worker 的总工作量. 为 `None` 时使用各 worker 汇报的 `total` 之和.
    pub fn new(n_workers: usize, expected_total: Option<usize>) -> Self {
        Self {
            done: vec![0; n_workers],
            totals: vec![0; n_workers],
            expected_total,
            fraction: 0.0,
        }
    }

    /// 接收一条消息, 返回更新后的完成比例. 未知 worker 编号会被忽略.
    pub fn update(&mut self, msg: ProgressMessage) -> f64 {
        if let (Some(d), Some(t)) = (self.done.get_mut(msg.worker_id), self.totals.get_mut(msg.worker_id)) {
            *d = msg.voxel_index;
            *t = msg.total;
        }
        let total = self.expected_total.unwrap_or_else(|| self.totals.iter().sum());
        if total > 0 {
            let f = (self.done.iter().sum::<usize>() as f64 / total as f64).clamp(0.0, 1.0);
            self.fraction = self.fraction.max(f);
        }
        self.fraction
    }

    /// 当前完成比例.
    #[inline]
    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    /// 任务成功后标记为全部完成.
    pub fn complete(&mut self) -> f64 {
        self.fraction = 1.0;
        self.fraction
    }
}

/// 处理日志. 总长度超过 [`MAX_LOG_SIZE`] 个字符后不再追加.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessLog {
    text: String,
    chars: usize,
    truncated: bool,
}

impl ProcessLog {
    /// 空日志.
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一行.
    pub fn push_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        let n = line.chars().count() + 1;
        if self.chars + n > MAX_LOG_SIZE {
            self.truncated = true;
            log::warn!("处理日志超过 {MAX_LOG_SIZE} 个字符, 之后的内容被丢弃");
            self.text.push_str("[日志已截断]\n");
            return;
        }
        self.chars += n;
        self.text.push_str(line);
        self.text.push('\n');
    }

    /// 是否发生过截断?
    #[inline]
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// 日志文本.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// 取出日志文本.
    pub fn into_string(self) -> String {
        self.text
    }
}
