use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Minimum gap between two redraws of the live line
const REDRAW_INTERVAL: Duration = Duration::from_millis(100);

const NARROW_BAR: usize = 30;
const WIDE_BAR: usize = 40;

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;

/// Format bytes as a human-readable string
pub fn format_bytes(bytes: u64) -> String {
    match bytes {
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{b} B"),
    }
}

fn format_eta(remaining_secs: f64) -> String {
    if remaining_secs < 60.0 {
        format!("{remaining_secs:.0}s")
    } else if remaining_secs < 3600.0 {
        format!("{:.0}m", remaining_secs / 60.0)
    } else {
        format!("{:.1}h", remaining_secs / 3600.0)
    }
}

fn bar_width() -> usize {
    match crossterm::terminal::size() {
        Ok((cols, _)) if cols > 80 => WIDE_BAR,
        _ => NARROW_BAR,
    }
}

fn speed(current: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        current as f64 / secs
    } else {
        0.0
    }
}

fn render_line(current: u64, total: u64, elapsed: Duration, width: usize) -> String {
    let percent = if total > 0 {
        current as f64 / total as f64 * 100.0
    } else {
        0.0
    };

    let speed = speed(current, elapsed);
    let eta = if speed > 0.0 && total > 0 {
        format_eta(total.saturating_sub(current) as f64 / speed)
    } else {
        "--".to_string()
    };

    let filled = ((percent / 100.0 * width as f64) as usize).min(width);
    let bar = format!("{}{}", "█".repeat(filled), "░".repeat(width - filled));

    format!(
        "[{bar}] {percent:.1}% ({} / {}) {}/s ETA {eta}",
        format_bytes(current),
        format_bytes(total),
        format_bytes(speed as u64),
    )
}

struct State {
    name: String,
    total: u64,
    current: u64,
    started: Instant,
    last_draw: Option<Instant>,
    finished: bool,
}

/// Shared progress tracker for one file.
///
/// Clones share the same counters, so a handle can be kept to call
/// [`Progress::finish`] after the wrapped stream has been moved elsewhere.
#[derive(Clone)]
pub struct Progress {
    state: Arc<Mutex<State>>,
    bar: ProgressBar,
    quiet: bool,
}

impl Progress {
    pub fn new(name: impl Into<String>, total: u64, quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::stdout());
            if let Ok(style) = ProgressStyle::with_template("{msg}") {
                bar.set_style(style);
            }
            bar
        };

        Self {
            state: Arc::new(Mutex::new(State {
                name: name.into(),
                total,
                current: 0,
                started: Instant::now(),
                last_draw: None,
                finished: false,
            })),
            bar,
            quiet,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn transferred(&self) -> u64 {
        self.lock().current
    }

    /// Record `n` more bytes and redraw if the last draw is old enough
    pub fn advance(&self, n: usize) {
        let line = {
            let mut state = self.lock();
            state.current += n as u64;

            if self.quiet || state.finished {
                return;
            }
            let now = Instant::now();
            if state
                .last_draw
                .is_some_and(|last| now.duration_since(last) < REDRAW_INTERVAL)
            {
                return;
            }
            state.last_draw = Some(now);

            render_line(
                state.current,
                state.total,
                state.started.elapsed(),
                bar_width(),
            )
        };

        self.bar.set_message(line);
    }

    /// Clear the live line and print the one-line summary. Runs once.
    pub fn finish(&self) {
        let summary = {
            let mut state = self.lock();
            if state.finished {
                return;
            }
            state.finished = true;

            let elapsed = state.started.elapsed();
            format!(
                "  {}  {}  {}/s  {:.1}s",
                state.name,
                format_bytes(state.current),
                format_bytes(speed(state.current, elapsed) as u64),
                elapsed.as_secs_f64(),
            )
        };

        if self.quiet {
            return;
        }
        self.bar.finish_and_clear();
        println!("{summary}");
    }

    pub fn wrap_reader<R>(&self, inner: R) -> ProgressReader<R> {
        ProgressReader {
            inner,
            progress: self.clone(),
        }
    }

    pub fn wrap_writer<W>(&self, inner: W) -> ProgressWriter<W> {
        ProgressWriter {
            inner,
            progress: self.clone(),
        }
    }
}

pub struct ProgressReader<R> {
    inner: R,
    progress: Progress,
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            this.progress.advance(buf.filled().len() - before);
        }
        poll
    }
}

pub struct ProgressWriter<W> {
    inner: W,
    progress: Progress,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ProgressWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            this.progress.advance(n);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
