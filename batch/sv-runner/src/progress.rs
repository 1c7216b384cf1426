//! 命令行进度输出.

use perf_berry::task::{ProgressSink, TaskOutcome};

/// 每前进 10% 打印一次进度的 [`ProgressSink`].
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    name: String,
    next: u32,
}

impl ConsoleSink {
    /// 进度前缀为 `name`.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into(), next: 10 }
    }
}

impl<T> ProgressSink<T> for ConsoleSink {
    fn progress(&mut self, fraction: f64) {
        let pct = (fraction * 100.0).floor() as u32;
        if pct >= self.next {
            log::info!("[{}] {pct}%", self.name);
            self.next = (pct / 10 + 1) * 10;
        }
    }

    fn finished(&mut self, outcome: &TaskOutcome<T>, log: &str) {
        match outcome {
            TaskOutcome::Failed(e) => {
                log::error!("[{}] 失败: {e}", self.name);
                for line in log.lines() {
                    log::debug!("[{}] {line}", self.name);
                }
            }
            _ => log::info!("[{}] {}", self.name, outcome.status()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_advances() {
        let mut s = ConsoleSink::new("sv");
        ProgressSink::<()>::progress(&mut s, 0.05);
        assert_eq!(s.next, 10);
        ProgressSink::<()>::progress(&mut s, 0.37);
        assert_eq!(s.next, 40);
        ProgressSink::<()>::progress(&mut s, 1.0);
        assert_eq!(s.next, 110);
    }
}
