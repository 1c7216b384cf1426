//! 批处理结果统计.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// 可中断的累计计时器.
#[derive(Clone, Debug)]
pub struct AccTimer {
    consumed: Duration,
    since: Instant,
}

impl AccTimer {
    /// 初始化计时器, 并视为已经开始计时.
    #[inline]
    pub fn new() -> Self {
        Self {
            consumed: Duration::ZERO,
            since: Instant::now(),
        }
    }

    /// 开始计时.
    #[inline]
    pub fn start(&mut self) {
        self.since = Instant::now();
    }

    /// 结束计时, 并将这一区间的时间累加. 返回本轮计时时长.
    ///
    /// # 注意
    ///
    /// 上一次调用必须是 `self.start()`, 否则计算时间值无意义.
    #[inline]
    pub fn elapsed(&mut self) -> Duration {
        let d = self.since.elapsed();
        self.consumed += d;
        d
    }

    /// 累计时间 (毫秒).
    #[inline]
    pub fn get_total_ms(&self) -> u64 {
        self.consumed.as_millis() as u64
    }
}

impl Default for AccTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个批处理条目的执行情况.
#[derive(Debug, Clone)]
pub struct EntryResult {
    /// 流程类型, 例如 `supervoxels`.
    pub kind: &'static str,

    /// 输出名称.
    pub name: String,

    /// 读写文件耗时.
    pub io: AccTimer,

    /// 计算耗时.
    pub compute: AccTimer,

    /// 写出的文件. 失败时为空.
    pub files: Vec<PathBuf>,

    /// 附加说明, 例如超体素个数.
    pub summary: Option<String>,

    /// 失败原因.
    pub error: Option<String>,
}

impl EntryResult {
    /// 新建条目, 计时器清零.
    pub fn new<S: Into<String>>(kind: &'static str, name: S) -> Self {
        Self {
            kind,
            name: name.into(),
            io: AccTimer::new(),
            compute: AccTimer::new(),
            files: Vec::new(),
            summary: None,
            error: None,
        }
    }

    /// 是否成功?
    #[inline]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// 将条目结果写进 `w` 中.
fn describe_into<W: Write>(r: &EntryResult, w: &mut W) -> io::Result<()> {
    const S4: &str = "    ";

    writeln!(w, "Entry `{}` ({}):", r.name, r.kind)?;
    match &r.error {
        None => writeln!(w, "{S4}Status: succeeded")?,
        Some(e) => writeln!(w, "{S4}Status: failed ({e})")?,
    }
    if let Some(s) = &r.summary {
        writeln!(w, "{S4}{s}")?;
    }
    writeln!(w, "{S4}I/O time: {} ms", r.io.get_total_ms())?;
    writeln!(w, "{S4}Compute time: {} ms", r.compute.get_total_ms())?;
    write!(w, "{S4}Files written: {}", r.files.len())?;
    for f in &r.files {
        write!(w, "\n{S4}{S4}{}", f.display())?;
    }
    Ok(())
}

/// 整个批处理的结果.
#[derive(Debug, Default)]
pub struct BatchResult {
    entries: Vec<EntryResult>,
}

impl BatchResult {
    /// 添加条目结果.
    pub fn push(&mut self, r: EntryResult) {
        self.entries.push(r);
    }

    /// 全部条目.
    pub fn entries(&self) -> &[EntryResult] {
        &self.entries
    }

    /// 是否全部成功?
    pub fn all_succeeded(&self) -> bool {
        self.entries.iter().all(EntryResult::is_success)
    }

    /// 将全部结果写进 `w`, 条目之间以分隔线隔开.
    pub fn describe_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        utils::sep_to(&mut *w)?;
        for r in &self.entries {
            describe_into(r, w)?;
            writeln!(w)?;
            utils::sep_to(&mut *w)?;
        }
        let failed = self.entries.iter().filter(|r| !r.is_success()).count();
        writeln!(w, "{} entries, {failed} failed", self.entries.len())
    }

    /// 打印运行结果.
    pub fn analyze(&self) {
        let mut buf = Vec::with_capacity(512);
        if self.describe_to(&mut buf).is_ok() {
            print!("{}", String::from_utf8_lossy(&buf));
        }
    }
}
