//! 后台多任务执行.
//!
//! 输入参数沿第 0 轴切成 `n` 块 (见 [`Partition`]), 每块交给 [`WorkerPool`] 中的一个 worker.
//! worker 通过 [`ProgressSender`] 汇报进度, 由一个独立的监视线程定时汇总并通知 [`ProgressSink`].
//! 全部 worker 成功后, 结果按 worker 编号顺序合并 (见 [`Recombine`]).
//!
//! # 注意
//!
//! 1. 任何一个 worker 失败 (返回错误或 panic) 都会使整个任务失败, 其余结果被丢弃.
//!    只报告第一个失败.
//! 2. 取消只保证调用者不再等待, 并忽略之后的结果. 已经开始的 worker 会继续运行到结束,
//!    除非它自己检查 [`ProgressSender::is_cancelled`].
//! 3. worker 是同一进程内的线程, 而不是独立的操作系统进程. 每个 worker 独占一份拷贝的输入块,
//!    与监视线程之间只通过通道通信; worker 中的 panic 会被捕获并作为该 worker 的失败报告
//!    ([`TaskError::WorkerPanicked`]), 不会影响调用者.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::consts::POLL_INTERVAL;

mod error;
mod partition;
mod pool;
mod progress;

pub use error::{TaskError, TaskResult};
pub use partition::{chunk_range, Broadcast, Partition, Recombine, Single};
pub use pool::WorkerPool;
pub use progress::{ProcessLog, ProgressMessage, ProgressSender, ProgressTracker};

use progress::WorkerEvent;

/// 任务状态.
///
/// `NotStarted -> Running -> {Succeeded, Failed, Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskStatus {
    /// 尚未启动.
    #[default]
    NotStarted,
    /// 正在运行.
    Running,
    /// 失败.
    Failed,
    /// 成功.
    Succeeded,
    /// 已取消.
    Cancelled,
}

impl TaskStatus {
    /// 是否为终止状态?
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Succeeded | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not-started",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// 任务最终结果.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    /// 全部 worker 成功, 结果已合并.
    Succeeded(T),
    /// 第一个失败原因.
    Failed(TaskError),
    /// 调用者取消了任务.
    Cancelled,
}

impl<T> TaskOutcome<T> {
    /// 对应的终止状态.
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Succeeded(_) => TaskStatus::Succeeded,
            Self::Failed(_) => TaskStatus::Failed,
            Self::Cancelled => TaskStatus::Cancelled,
        }
    }

    /// 是否成功?
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// 转换为 `Result`. 取消视为 [`TaskError::Cancelled`].
    pub fn into_result(self) -> TaskResult<T> {
        match self {
            Self::Succeeded(t) => Ok(t),
            Self::Failed(e) => Err(e),
            Self::Cancelled => Err(TaskError::Cancelled),
        }
    }

    /// 变换成功结果.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> TaskOutcome<U> {
        match self {
            Self::Succeeded(t) => TaskOutcome::Succeeded(f(t)),
            Self::Failed(e) => TaskOutcome::Failed(e),
            Self::Cancelled => TaskOutcome::Cancelled,
        }
    }
}

/// 进度和结果的接收者 (GUI, 命令行进度条等).
///
/// 两个方法都在监视线程上调用.
pub trait ProgressSink<T>: Send {
    /// 当前完成比例, 位于 \[0, 1\], 单调不减.
    fn progress(&mut self, fraction: f64);

    /// 任务结束 (成功或失败) 时调用一次. 取消的任务不会调用.
    fn finished(&mut self, outcome: &TaskOutcome<T>, log: &str) {
        let _ = (outcome, log);
    }
}

/// 丢弃所有通知.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl<T> ProgressSink<T> for NullSink {
    fn progress(&mut self, _: f64) {}
}

/// 只关心进度的闭包.
impl<T, F: FnMut(f64) + Send> ProgressSink<T> for F {
    fn progress(&mut self, fraction: f64) {
        self(fraction)
    }
}

struct State<T> {
    status: TaskStatus,
    progress: f64,
    outcome: Option<TaskOutcome<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    done: Condvar,
    cancelled: Arc<AtomicBool>,
}

impl<T> Shared<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(State { status: TaskStatus::Running, progress: 0.0, outcome: None }),
            done: Condvar::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn set_progress(&self, fraction: f64) {
        let mut st = self.lock();
        st.progress = st.progress.max(fraction);
    }

    /// 只有仍在运行的任务才会接受结果.
    fn finish(&self, outcome: TaskOutcome<T>) -> bool {
        let mut st = self.lock();
        if st.status != TaskStatus::Running {
            return false;
        }
        st.status = outcome.status();
        st.outcome = Some(outcome);
        self.done.notify_all();
        true
    }
}

/// 正在运行的后台任务的句柄.
pub struct TaskHandle<T> {
    shared: Arc<Shared<T>>,
    name: String,
}

impl<T> TaskHandle<T> {
    /// 任务名.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 当前状态.
    pub fn status(&self) -> TaskStatus {
        self.shared.lock().status
    }

    /// 最近一次轮询得到的完成比例.
    pub fn progress(&self) -> f64 {
        self.shared.lock().progress
    }

    /// 是否已经结束?
    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// 取消任务: 停止轮询并忽略之后的结果. 对已结束的任务无效.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Relaxed);
        let mut st = self.shared.lock();
        if st.status == TaskStatus::Running {
            st.status = TaskStatus::Cancelled;
            st.outcome = Some(TaskOutcome::Cancelled);
            self.shared.done.notify_all();
            log::info!("任务 `{}` 已取消", self.name);
        }
    }

    /// 阻塞直到任务结束 (同步模式).
    pub fn wait(self) -> TaskOutcome<T> {
        let mut st = self.shared.lock();
        loop {
            if let Some(outcome) = st.outcome.take() {
                return outcome;
            }
            st = self.shared.done.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// 最多等待 `timeout`, 返回任务是否已结束.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let st = self.shared.lock();
        let (st, _) = self
            .shared
            .done
            .wait_timeout_while(st, timeout, |st| !st.status.is_terminal())
            .unwrap_or_else(PoisonError::into_inner);
        st.status.is_terminal()
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("progress", &self.progress())
            .finish()
    }
}

/// 后台任务启动器.
///
/// ```ignore
/// let pool = WorkerPool::new(4);
/// let handle = TaskRunner::new(&pool)
///     .name("double")
///     .start(data, |_, _, chunk: Array1<f64>| Ok::<_, String>(chunk * 2.0), NullSink);
/// let doubled = handle.wait().into_result()?;
/// ```
#[derive(Debug)]
pub struct TaskRunner<'p> {
    pool: &'p WorkerPool,
    n_workers: usize,
    poll_interval: Duration,
    expected_total: Option<usize>,
    name: String,
}

impl<'p> TaskRunner<'p> {
    /// 默认 worker 数等于线程池大小.
    pub fn new(pool: &'p WorkerPool) -> Self {
        Self {
            pool,
            n_workers: pool.size(),
            poll_interval: POLL_INTERVAL,
            expected_total: None,
            name: "task".to_string(),
        }
    }

    /// worker 个数. 0 按 1 处理.
    pub fn workers(mut self, n: usize) -> Self {
        self.n_workers = n.max(1);
        self
    }

    /// 轮询周期.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// 全部 worker 的总工作量. 不设置时使用各 worker 汇报的 `total` 之和.
    pub fn expected_total(mut self, total: usize) -> Self {
        self.expected_total = Some(total);
        self
    }

    /// 任务名, 只用于日志.
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// 启动任务. `work(worker_id, progress, chunk)` 在线程池上执行.
    pub fn start<A, R, E, F, S>(self, args: A, work: F, sink: S) -> TaskHandle<R::Output>
    where
        A: Partition,
        R: Recombine,
        E: fmt::Display,
        F: Fn(usize, &ProgressSender, A::Part) -> Result<R, E> + Send + Sync + 'static,
        S: ProgressSink<R::Output> + 'static,
    {
        self.start_with(args, work, |out, _| Ok(out), sink)
    }

    /// 启动任务, 并在合并结果之后于监视线程上执行 `post(output, log)`.
    pub fn start_with<A, R, E, F, P, T, S>(self, args: A, work: F, post: P, sink: S) -> TaskHandle<T>
    where
        A: Partition,
        R: Recombine,
        E: fmt::Display,
        F: Fn(usize, &ProgressSender, A::Part) -> Result<R, E> + Send + Sync + 'static,
        P: FnOnce(R::Output, &ProcessLog) -> TaskResult<T> + Send + 'static,
        T: Send + 'static,
        S: ProgressSink<T> + 'static,
    {
        let parts = args.partition(self.n_workers);
        let n = parts.len();
        let shared = Arc::new(Shared::new());
        let (event_tx, event_rx) = mpsc::channel();
        let (result_tx, result_rx) = mpsc::channel();
        let work = Arc::new(work);

        log::debug!("启动任务 `{}`, worker 数 {n}", self.name);
        for (id, part) in parts.into_iter().enumerate() {
            let sender = ProgressSender::new(id, event_tx.clone(), Arc::clone(&shared.cancelled));
            let result_tx = result_tx.clone();
            let work = Arc::clone(&work);
            self.pool.execute(move || {
                let r = match panic::catch_unwind(AssertUnwindSafe(|| work(id, &sender, part))) {
                    Ok(Ok(r)) => Ok(r),
                    Ok(Err(e)) => Err(TaskError::WorkerFailed { worker: id, message: e.to_string() }),
                    Err(payload) => Err(TaskError::WorkerPanicked { worker: id, message: panic_message(&*payload) }),
                };
                let _ = result_tx.send((id, r));
            });
        }
        drop(result_tx);
        drop(event_tx);

        let monitor = Monitor {
            name: self.name.clone(),
            n_workers: n,
            interval: self.poll_interval,
            shared: Arc::clone(&shared),
            events: event_rx,
            results: result_rx,
            tracker: ProgressTracker::new(n, self.expected_total),
            log: ProcessLog::new(),
            post,
            sink,
        };
        let spawned = thread::Builder::new()
            .name(format!("{}-monitor", self.name))
            .spawn(move || monitor.run());
        if let Err(e) = spawned {
            log::error!("任务 `{}` 无法启动监视线程: {e}", self.name);
            shared.finish(TaskOutcome::Failed(TaskError::Spawn(e.to_string())));
        }
        TaskHandle { shared, name: self.name }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知 panic".to_string()
    }
}

/// 轮询线程: 收集结果, 定时汇总进度.
struct Monitor<R, T, P, S> {
    name: String,
    n_workers: usize,
    interval: Duration,
    shared: Arc<Shared<T>>,
    events: Receiver<WorkerEvent>,
    results: Receiver<(usize, TaskResult<R>)>,
    tracker: ProgressTracker,
    log: ProcessLog,
    post: P,
    sink: S,
}

impl<R, T, P, S> Monitor<R, T, P, S>
where
    R: Recombine,
    P: FnOnce(R::Output, &ProcessLog) -> TaskResult<T>,
    S: ProgressSink<T>,
{
    fn run(mut self) {
        let mut parts: Vec<Option<R>> = (0..self.n_workers).map(|_| None).collect();
        let mut received = 0;
        let mut failure = None;
        let mut next_tick = Instant::now() + self.interval;

        while received < self.n_workers {
            if self.shared.is_cancelled() {
                return;
            }
            match self.results.recv_timeout(next_tick.saturating_duration_since(Instant::now())) {
                Ok((id, Ok(r))) => {
                    if let Some(slot) = parts.get_mut(id) {
                        if slot.replace(r).is_none() {
                            received += 1;
                        }
                    }
                }
                Ok((_, Err(e))) => {
                    failure = Some(e);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    failure = Some(TaskError::Disconnected);
                    break;
                }
            }
            if Instant::now() >= next_tick {
                self.poll();
                next_tick = Instant::now() + self.interval;
            }
        }
        if self.shared.is_cancelled() {
            return;
        }
        self.drain();

        let outcome = match failure {
            Some(e) => TaskOutcome::Failed(e),
            None => {
                let merged = R::recombine(parts.into_iter().flatten().collect());
                match merged.and_then(|out| (self.post)(out, &self.log)) {
                    Ok(t) => TaskOutcome::Succeeded(t),
                    Err(e) => TaskOutcome::Failed(e),
                }
            }
        };
        match &outcome {
            TaskOutcome::Failed(e) => {
                log::warn!("任务 `{}` 失败: {e}", self.name);
                self.log.push_line(&format!("错误: {e}"));
            }
            _ => {
                let f = self.tracker.complete();
                self.shared.set_progress(f);
                self.sink.progress(f);
                log::debug!("任务 `{}` 完成", self.name);
            }
        }
        self.sink.finished(&outcome, self.log.as_str());
        self.shared.finish(outcome);
    }

    fn drain(&mut self) {
        for event in self.events.try_iter() {
            match event {
                WorkerEvent::Progress(msg) => {
                    self.tracker.update(msg);
                }
                WorkerEvent::Log(line) => self.log.push_line(&line),
            }
        }
    }

    fn poll(&mut self) {
        self.drain();
        let f = self.tracker.fraction();
        self.shared.set_progress(f);
        self.sink.progress(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2, Axis};
    use std::collections::BTreeMap;

    const FAST: Duration = Duration::from_millis(1);

    #[derive(Clone, Default)]
    struct Recorder {
        values: Arc<Mutex<Vec<f64>>>,
        finished: Arc<Mutex<Vec<(TaskStatus, String)>>>,
    }

    impl<T> ProgressSink<T> for Recorder {
        fn progress(&mut self, fraction: f64) {
            self.values.lock().unwrap().push(fraction);
        }

        fn finished(&mut self, outcome: &TaskOutcome<T>, log: &str) {
            self.finished.lock().unwrap().push((outcome.status(), log.to_string()));
        }
    }

    #[test]
    fn test_split_and_recombine() {
        let pool = WorkerPool::new(3);
        let data = Array2::from_shape_fn((10, 2), |(i, j)| (i * 2 + j) as f64);
        let handle = TaskRunner::new(&pool)
            .name("double")
            .poll_interval(FAST)
            .start(
                (data.clone(), Broadcast(2.0)),
                |id, progress, (chunk, k): (Array2<f64>, f64)| {
                    progress.log(format!("worker {id}: {} 行", chunk.nrows()));
                    progress.report(chunk.nrows(), chunk.nrows());
                    Ok::<_, String>(chunk * k)
                },
                NullSink,
            );
        let out = handle.wait().into_result().unwrap();
        assert_eq!(out, data * 2.0);
        pool.shutdown();
    }

    #[test]
    fn test_named_outputs_and_log() {
        let pool = WorkerPool::new(2);
        let data = Array1::from_iter((0..7).map(|v| v as f32));
        let handle = TaskRunner::new(&pool).poll_interval(FAST).start_with(
            data,
            |id, progress, chunk: Array1<f32>| {
                progress.log(format!("worker {id} 开始"));
                let mut out = BTreeMap::new();
                out.insert("sum".to_string(), Array1::from_elem(1, chunk.sum()));
                out.insert("id".to_string(), Array1::from_elem(1, id as f32));
                Ok::<_, String>(out)
            },
            |out, log| {
                assert!(log.as_str().contains("worker 0 开始"));
                assert!(log.as_str().contains("worker 1 开始"));
                Ok(out)
            },
            NullSink,
        );
        let out = handle.wait().into_result().unwrap();
        // 7 个元素分 2 块: [0..4] 与 [4..7].
        assert_eq!(out["sum"].to_vec(), vec![6.0, 15.0]);
        assert_eq!(out["id"].to_vec(), vec![0.0, 1.0]);
        pool.shutdown();
    }

    #[test]
    fn test_first_failure_wins() {
        let pool = WorkerPool::new(2);
        let recorder = Recorder::default();
        let handle = TaskRunner::new(&pool).poll_interval(FAST).start(
            Array1::<f64>::zeros(4),
            |id, _, chunk: Array1<f64>| if id == 1 { Err("boom") } else { Ok(chunk) },
            recorder.clone(),
        );
        match handle.wait() {
            TaskOutcome::Failed(TaskError::WorkerFailed { worker, message }) => {
                assert_eq!(worker, 1);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let finished = recorder.finished.lock().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].0, TaskStatus::Failed);
        assert!(finished[0].1.contains("boom"));
        pool.shutdown();
    }

    #[test]
    fn test_panic_is_captured() {
        let pool = WorkerPool::new(1);
        let handle = TaskRunner::new(&pool).poll_interval(FAST).start(
            Array1::<f64>::zeros(3),
            |_, _, chunk: Array1<f64>| -> Result<Array1<f64>, String> {
                if chunk.is_empty() {
                    return Ok(chunk);
                }
                panic!("singular matrix")
            },
            NullSink,
        );
        let status_err = handle.wait().into_result().unwrap_err();
        assert_eq!(
            status_err,
            TaskError::WorkerPanicked { worker: 0, message: "singular matrix".to_string() }
        );
        // 线程池在 panic 之后仍然可用.
        let handle = TaskRunner::new(&pool)
            .poll_interval(FAST)
            .start((), |_, _, _| Ok::<_, String>(()), NullSink);
        assert!(handle.wait().is_success());
        pool.shutdown();
    }

    #[test]
    fn test_cancel() {
        let pool = WorkerPool::new(1);
        let recorder = Recorder::default();
        let handle = TaskRunner::new(&pool).poll_interval(FAST).start(
            (),
            |_, progress, _| {
                while !progress.is_cancelled() {
                    thread::sleep(FAST);
                }
                Ok::<_, String>(())
            },
            recorder.clone(),
        );
        assert_eq!(handle.status(), TaskStatus::Running);
        handle.cancel();
        assert_eq!(handle.status(), TaskStatus::Cancelled);
        assert!(handle.is_finished());
        assert!(matches!(handle.wait(), TaskOutcome::Cancelled));
        pool.shutdown();
        assert!(recorder.finished.lock().unwrap().is_empty());
    }

    #[test]
    fn test_progress_monotonic() {
        let pool = WorkerPool::new(3);
        let recorder = Recorder::default();
        let data = Array1::from_iter(0..30);
        let total = data.len();
        let handle = TaskRunner::new(&pool)
            .poll_interval(FAST)
            .expected_total(total)
            .start(
                data,
                |_, progress, chunk: Array1<i32>| {
                    let n = chunk.len();
                    for i in 0..=n {
                        progress.report(i, n);
                        // 偶尔重复发送旧值.
                        if i > 0 && i % 3 == 0 {
                            progress.report(i - 1, n);
                        }
                        thread::sleep(FAST);
                    }
                    Ok::<_, String>(chunk.insert_axis(Axis(1)))
                },
                recorder.clone(),
            );
        let out = handle.wait().into_result().unwrap();
        assert_eq!(out.len(), total);

        let values = recorder.values.lock().unwrap();
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(values.last().copied(), Some(1.0));
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
        pool.shutdown();
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TaskStatus::default(), TaskStatus::NotStarted);
        assert!(!TaskStatus::Running.is_terminal());
        assert_eq!(TaskStatus::Cancelled.to_string(), "cancelled");
    }
}
