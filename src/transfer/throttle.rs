use std::future::Future;
use std::io;
use std::num::ParseFloatError;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};
use tokio_util::either::Either;

/// How long an adapter parks when its bucket is empty
const REFILL_WAIT: Duration = Duration::from_millis(10);

const KB: f64 = 1024.0;
const MB: f64 = KB * 1024.0;
const GB: f64 = MB * 1024.0;

#[derive(Debug, Error)]
pub enum BandwidthError {
    #[error("invalid bandwidth limit {input:?}: {source}")]
    Invalid {
        input: String,
        #[source]
        source: ParseFloatError,
    },

    #[error("bandwidth limit must be positive, got {0:?}")]
    NotPositive(String),
}

/// Parse a limit like `500K`, `1.5M` or `2GB` into bytes per second.
///
/// An empty string means unlimited and yields 0.
pub fn parse_bandwidth_limit(input: &str) -> Result<u64, BandwidthError> {
    if input.is_empty() {
        return Ok(0);
    }

    let s = input.trim().to_ascii_uppercase();

    let (number, multiplier) = [
        ("GB", GB),
        ("G", GB),
        ("MB", MB),
        ("M", MB),
        ("KB", KB),
        ("K", KB),
        ("B", 1.0),
    ]
    .iter()
    .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|n| (n, *mult)))
    .unwrap_or((s.as_str(), 1.0));

    let value: f64 = number.trim().parse().map_err(|source| BandwidthError::Invalid {
        input: s.clone(),
        source,
    })?;

    if !value.is_finite() || value <= 0.0 {
        return Err(BandwidthError::NotPositive(s));
    }

    Ok((value * multiplier) as u64)
}

/// Token bucket holding at most one second worth of bytes
#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec as f64;
        Self {
            rate,
            tokens: rate,
            last: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
    }

    fn available(&self) -> usize {
        self.tokens as usize
    }

    fn consume(&mut self, n: usize) {
        self.tokens = (self.tokens - n as f64).max(0.0);
    }
}

/// Wrap `reader` in a throttle, or hand it back untouched when `bytes_per_sec` is 0.
pub fn limit_reader<R>(reader: R, bytes_per_sec: u64) -> Either<R, ThrottledReader<R>>
where
    R: AsyncRead + Unpin,
{
    if bytes_per_sec == 0 {
        Either::Left(reader)
    } else {
        Either::Right(ThrottledReader::new(reader, bytes_per_sec))
    }
}

/// Wrap `writer` in a throttle, or hand it back untouched when `bytes_per_sec` is 0.
pub fn limit_writer<W>(writer: W, bytes_per_sec: u64) -> Either<W, ThrottledWriter<W>>
where
    W: AsyncWrite + Unpin,
{
    if bytes_per_sec == 0 {
        Either::Left(writer)
    } else {
        Either::Right(ThrottledWriter::new(writer, bytes_per_sec))
    }
}

/// Rate-limited reader.
///
/// Each read is clamped to the tokens currently in the bucket. With an empty
/// bucket the task waits out a short timer and tries again instead of
/// returning zero bytes, which would read as end of stream.
#[derive(Debug)]
pub struct ThrottledReader<R> {
    inner: R,
    bucket: TokenBucket,
    wait: Option<Pin<Box<Sleep>>>,
}

impl<R> ThrottledReader<R> {
    pub fn new(inner: R, bytes_per_sec: u64) -> Self {
        Self {
            inner,
            bucket: TokenBucket::new(bytes_per_sec),
            wait: None,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ThrottledReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if let Some(wait) = this.wait.as_mut() {
                ready!(wait.as_mut().poll(cx));
                this.wait = None;
            }

            this.bucket.refill();
            let allowed = this.bucket.available().min(buf.remaining());
            if allowed == 0 {
                this.wait = Some(Box::pin(sleep(REFILL_WAIT)));
                continue;
            }

            let n = {
                let dst = buf.initialize_unfilled_to(allowed);
                let mut limited = ReadBuf::new(dst);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut limited))?;
                limited.filled().len()
            };

            buf.advance(n);
            this.bucket.consume(n);
            return Poll::Ready(Ok(()));
        }
    }
}

/// Rate-limited writer.
///
/// A single `poll_write` pushes as many token-sized chunks through as the
/// bucket allows and only parks when nothing was written yet. Use
/// `write_all` for the all-or-error guarantee.
#[derive(Debug)]
pub struct ThrottledWriter<W> {
    inner: W,
    bucket: TokenBucket,
    wait: Option<Pin<Box<Sleep>>>,
}

impl<W> ThrottledWriter<W> {
    pub fn new(inner: W, bytes_per_sec: u64) -> Self {
        Self {
            inner,
            bucket: TokenBucket::new(bytes_per_sec),
            wait: None,
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ThrottledWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut written = 0;

        while written < buf.len() {
            this.bucket.refill();
            let allowed = this.bucket.available().min(buf.len() - written);

            if allowed == 0 {
                if written > 0 {
                    break;
                }
                let wait = this
                    .wait
                    .get_or_insert_with(|| Box::pin(sleep(REFILL_WAIT)));
                ready!(wait.as_mut().poll(cx));
                this.wait = None;
                continue;
            }

            let chunk = &buf[written..written + allowed];
            match Pin::new(&mut this.inner).poll_write(cx, chunk) {
                Poll::Ready(Ok(0)) => break,
                Poll::Ready(Ok(n)) => {
                    this.bucket.consume(n);
                    written += n;
                }
                Poll::Ready(Err(e)) if written == 0 => return Poll::Ready(Err(e)),
                Poll::Ready(Err(_)) => break,
                Poll::Pending if written == 0 => return Poll::Pending,
                Poll::Pending => break,
            }
        }

        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
