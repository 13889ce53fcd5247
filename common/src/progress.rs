use std::sync::{Mutex, PoisonError};
use tracing::{Level, event, instrument};

const BAR_NAME_WIDTH: usize = 15;
const BAR_TEMPLATE: &str =
    "{msg:15} [{bar:20.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} {eta}";

#[derive(Debug)]
pub struct TlsCounter {
    // mutex is used primarily from one thread, so it's not a bottleneck
    count: thread_local::ThreadLocal<Mutex<u64>>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| Mutex::new(0));
        let mut guard = mutex.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count.iter().fold(0, |x, y| {
            x + *y.lock().unwrap_or_else(PoisonError::into_inner)
        })
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct ProgressCounter {
    started: TlsCounter,
    finished: TlsCounter,
}

pub struct ProgressGuard<'a> {
    progress: &'a ProgressCounter,
}

impl<'a> ProgressGuard<'a> {
    pub fn new(progress: &'a ProgressCounter) -> Self {
        progress.started.inc();
        Self { progress }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.progress.finished.inc();
    }
}

pub struct Status {
    pub started: u64,
    pub finished: u64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&self) -> ProgressGuard<'_> {
        ProgressGuard::new(self)
    }

    #[instrument]
    pub fn get(&self) -> Status {
        let mut status = Status {
            started: self.started.get(),
            finished: self.finished.get(),
        };
        if status.finished > status.started {
            event!(
                Level::DEBUG,
                "Progress inversion - started: {}, finished {}",
                status.started,
                status.finished
            );
            status.started = status.finished;
        }
        status
    }
}

/// Process-wide transfer counters, shared by every file of an operation
#[derive(Debug)]
pub struct Progress {
    pub files: ProgressCounter,
    pub bytes_transferred: TlsCounter,
    pub bytes_resumed: TlsCounter,
    pub files_transferred: TlsCounter,
    pub files_resumed: TlsCounter,
    pub directories_created: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            files: Default::default(),
            bytes_transferred: Default::default(),
            bytes_resumed: Default::default(),
            files_transferred: Default::default(),
            files_resumed: Default::default(),
            directories_created: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// One-line status for log output
    pub fn status_line(&self) -> String {
        let files = self.files.get();
        let secs = self.get_duration().as_secs_f64();
        let bytes = self.bytes_transferred.get();
        let rate = if secs > 0.0 { bytes as f64 / secs } else { 0.0 };
        format!(
            "files: {}/{} done, transferred: {} ({}/s)",
            files.finished,
            files.started,
            bytesize::ByteSize(bytes),
            bytesize::ByteSize(rate as u64)
        )
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

/// Shortens `name` to the bar label width, marking the cut with "..."
pub fn truncate_name(name: &str) -> String {
    if name.chars().count() <= BAR_NAME_WIDTH {
        return name.to_string();
    }
    let kept: String = name.chars().take(BAR_NAME_WIDTH - 3).collect();
    format!("{kept}...")
}

/// Byte progress bar for a single file; hidden unless `visible`
pub fn file_bar(
    bars: Option<&indicatif::MultiProgress>,
    visible: bool,
    name: &str,
    total: u64,
    position: u64,
) -> indicatif::ProgressBar {
    if !visible {
        return indicatif::ProgressBar::with_draw_target(
            Some(total),
            indicatif::ProgressDrawTarget::hidden(),
        )
        .with_position(position);
    }
    let style = match indicatif::ProgressStyle::with_template(BAR_TEMPLATE) {
        Ok(style) => style.progress_chars("=> "),
        Err(error) => {
            tracing::debug!("falling back to default bar style: {error}");
            indicatif::ProgressStyle::default_bar()
        }
    };
    let bar = indicatif::ProgressBar::with_draw_target(
        Some(total),
        indicatif::ProgressDrawTarget::stderr(),
    )
    .with_style(style)
    .with_message(truncate_name(name))
    .with_position(position);
    match bars {
        Some(bars) => bars.add(bar),
        None => bar,
    }
}
