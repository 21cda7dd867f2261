//! Bidirectional byte relay between two streams.
//!
//! Every tunnel kind ends up in [`full_duplex_copy`]: one copy loop per
//! direction, half-close on EOF, closed-class errors treated as normal
//! termination.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::trace;

use crate::error::is_closed_error;

const COPY_BUF_LEN: usize = 32 * 1024;

/// Direction of one copy loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LeftToRight,
    RightToLeft,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::LeftToRight => "left-to-right",
            Direction::RightToLeft => "right-to-left",
        })
    }
}

/// Summary handed to [`CopyOpts::on_end`] once both loops have finished.
#[derive(Debug)]
pub struct CopyReport {
    pub left_to_right: u64,
    pub right_to_left: u64,
    pub duration: Duration,
    /// The error [`full_duplex_copy`] returned, if any.
    pub error: Option<io::Error>,
    /// Which loop produced `error`.
    pub failed_direction: Option<Direction>,
}

type StartHook = Arc<dyn Fn() + Send + Sync>;
type StreamStartHook = Arc<dyn Fn(Direction) + Send + Sync>;
type StreamEndHook = Arc<dyn Fn(Direction, Option<&io::Error>) + Send + Sync>;
type EndHook = Arc<dyn Fn(&CopyReport) + Send + Sync>;

/// Callbacks and task placement for [`full_duplex_copy`].
#[derive(Clone, Default)]
pub struct CopyOpts {
    on_start: Option<StartHook>,
    on_stream_start: Option<StreamStartHook>,
    on_stream_end: Option<StreamEndHook>,
    on_end: Option<EndHook>,
    tracker: Option<TaskTracker>,
}

impl CopyOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(f));
        self
    }

    pub fn on_stream_start(mut self, f: impl Fn(Direction) + Send + Sync + 'static) -> Self {
        self.on_stream_start = Some(Arc::new(f));
        self
    }

    pub fn on_stream_end(
        mut self,
        f: impl Fn(Direction, Option<&io::Error>) + Send + Sync + 'static,
    ) -> Self {
        self.on_stream_end = Some(Arc::new(f));
        self
    }

    pub fn on_end(mut self, f: impl Fn(&CopyReport) + Send + Sync + 'static) -> Self {
        self.on_end = Some(Arc::new(f));
        self
    }

    /// Spawn the copy loops on `tracker` so their owner can join them.
    pub fn tracked_by(mut self, tracker: TaskTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match &self.tracker {
            Some(tracker) => {
                tracker.spawn(fut);
            }
            None => {
                tokio::spawn(fut);
            }
        }
    }
}

/// Copy bytes between `left` and `right` in both directions.
///
/// Returns as soon as the first loop finishes: `Ok(())` on clean EOF or when
/// `cancel` fires, otherwise the first relevant error. Broken pipes, resets
/// and EOF-class errors are not relevant. The remaining loop keeps running in
/// the background until its own EOF or until `cancel` fires; `on_end` is
/// called after both loops are done.
pub async fn full_duplex_copy<L, R>(
    cancel: &CancellationToken,
    left: L,
    right: R,
    opts: CopyOpts,
) -> io::Result<()>
where
    L: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let started = Instant::now();
    let (left_read, left_write) = tokio::io::split(left);
    let (right_read, right_write) = tokio::io::split(right);

    let l2r = Arc::new(AtomicU64::new(0));
    let r2l = Arc::new(AtomicU64::new(0));
    let (done_tx, mut done_rx) = mpsc::channel::<(Direction, Option<io::Error>)>(2);
    let (outcome_tx, outcome_rx) = oneshot::channel::<(Direction, io::Error)>();

    let loops = TaskTracker::new();
    loops.spawn(copy_loop(
        cancel.clone(),
        left_read,
        right_write,
        Direction::LeftToRight,
        l2r.clone(),
        done_tx.clone(),
        opts.clone(),
    ));
    loops.spawn(copy_loop(
        cancel.clone(),
        right_read,
        left_write,
        Direction::RightToLeft,
        r2l.clone(),
        done_tx,
        opts.clone(),
    ));
    loops.close();

    if let Some(f) = &opts.on_start {
        f();
    }

    let on_end = opts.on_end.clone();
    opts.spawn(async move {
        loops.wait().await;
        let (failed_direction, error) = match outcome_rx.await {
            Ok((direction, error)) => (Some(direction), Some(error)),
            Err(_) => (None, None),
        };
        let report = CopyReport {
            left_to_right: l2r.load(Ordering::Acquire),
            right_to_left: r2l.load(Ordering::Acquire),
            duration: started.elapsed(),
            error,
            failed_direction,
        };
        trace!(
            l2r = report.left_to_right,
            r2l = report.right_to_left,
            elapsed_ms = report.duration.as_millis() as u64,
            "duplex copy finished"
        );
        if let Some(f) = on_end {
            f(&report);
        }
    });

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        done = done_rx.recv() => match done {
            Some((direction, Some(e))) => {
                let _ = outcome_tx.send((direction, io::Error::new(e.kind(), e.to_string())));
                Err(e)
            }
            _ => Ok(()),
        },
    }
}

async fn copy_loop<Rd, Wr>(
    cancel: CancellationToken,
    mut from: Rd,
    mut to: Wr,
    direction: Direction,
    counter: Arc<AtomicU64>,
    done: mpsc::Sender<(Direction, Option<io::Error>)>,
    opts: CopyOpts,
) where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    if let Some(f) = &opts.on_stream_start {
        f(direction);
    }

    let error = tokio::select! {
        _ = cancel.cancelled() => None,
        result = copy_until_eof(&mut from, &mut to, &counter) => result.err().filter(is_relevant),
    };

    if let Some(f) = &opts.on_stream_end {
        f(direction, error.as_ref());
    }
    // The receiver is gone once the first loop has been reported.
    let _ = done.try_send((direction, error));
}

async fn copy_until_eof<Rd, Wr>(from: &mut Rd, to: &mut Wr, counter: &AtomicU64) -> io::Result<()>
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_LEN];
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        to.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::AcqRel);
    }
    // Half-close: the peer sees EOF while the opposite direction keeps flowing.
    to.shutdown().await
}

fn is_relevant(e: &io::Error) -> bool {
    !is_closed_error(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, ReadBuf};

    struct Failing(io::ErrorKind);

    impl AsyncRead for Failing {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(self.0, "boom")))
        }
    }

    impl AsyncWrite for Failing {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn copies_both_ways_and_reports_exact_counts() {
        const N: usize = 100_000;
        let (mut client_a, left) = duplex(8 * 1024);
        let (mut client_b, right) = duplex(8 * 1024);

        let (report_tx, report_rx) = oneshot::channel();
        let report_tx = std::sync::Mutex::new(Some(report_tx));
        let opts = CopyOpts::new().on_end(move |r: &CopyReport| {
            if let Some(tx) = report_tx.lock().unwrap().take() {
                let _ = tx.send((r.left_to_right, r.right_to_left, r.failed_direction.is_none()));
            }
        });

        let cancel = CancellationToken::new();
        let pump = tokio::spawn({
            let cancel = cancel.clone();
            async move { full_duplex_copy(&cancel, left, right, opts).await }
        });

        let a = tokio::spawn(async move {
            client_a.write_all(&vec![b'a'; N]).await.unwrap();
            client_a.shutdown().await.unwrap();
            let mut got = Vec::new();
            client_a.read_to_end(&mut got).await.unwrap();
            got
        });
        let b = tokio::spawn(async move {
            client_b.write_all(&vec![b'b'; N]).await.unwrap();
            client_b.shutdown().await.unwrap();
            let mut got = Vec::new();
            client_b.read_to_end(&mut got).await.unwrap();
            got
        });

        let from_b = a.await.unwrap();
        let from_a = b.await.unwrap();
        assert_eq!(from_a, vec![b'a'; N]);
        assert_eq!(from_b, vec![b'b'; N]);

        let result = tokio::time::timeout(Duration::from_secs(5), pump).await.unwrap().unwrap();
        assert!(result.is_ok());

        let (l2r, r2l, clean) = tokio::time::timeout(Duration::from_secs(5), report_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(l2r, N as u64);
        assert_eq!(r2l, N as u64);
        assert!(clean);
    }

    #[tokio::test]
    async fn relevant_error_is_returned_with_direction() {
        let (_client, right) = duplex(1024);
        let (report_tx, report_rx) = oneshot::channel();
        let report_tx = std::sync::Mutex::new(Some(report_tx));
        let opts = CopyOpts::new().on_end(move |r: &CopyReport| {
            if let Some(tx) = report_tx.lock().unwrap().take() {
                let _ = tx.send(r.failed_direction);
            }
        });

        let cancel = CancellationToken::new();
        let result =
            full_duplex_copy(&cancel, Failing(io::ErrorKind::PermissionDenied), right, opts).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::PermissionDenied);

        // The right-to-left loop still waits on the open duplex; cancel ends it.
        cancel.cancel();
        let failed = tokio::time::timeout(Duration::from_secs(5), report_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed, Some(Direction::LeftToRight));
    }

    #[tokio::test]
    async fn broken_pipe_is_not_an_error() {
        let (_client, right) = duplex(1024);
        let cancel = CancellationToken::new();
        let result = full_duplex_copy(
            &cancel,
            Failing(io::ErrorKind::BrokenPipe),
            right,
            CopyOpts::new(),
        )
        .await;
        assert!(result.is_ok());
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancel_returns_silently_and_calls_hooks() {
        let (_client_a, left) = duplex(1024);
        let (_client_b, right) = duplex(1024);
        let starts = Arc::new(AtomicU64::new(0));
        let ends = Arc::new(AtomicU64::new(0));
        let tracker = TaskTracker::new();
        let opts = CopyOpts::new()
            .on_stream_start({
                let starts = starts.clone();
                move |_| {
                    starts.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_stream_end({
                let ends = ends.clone();
                move |_, err| {
                    assert!(err.is_none());
                    ends.fetch_add(1, Ordering::SeqCst);
                }
            })
            .tracked_by(tracker.clone());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        assert!(full_duplex_copy(&cancel, left, right, opts).await.is_ok());

        tracker.close();
        tokio::time::timeout(Duration::from_secs(5), tracker.wait())
            .await
            .unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(ends.load(Ordering::SeqCst), 2);
    }
}
