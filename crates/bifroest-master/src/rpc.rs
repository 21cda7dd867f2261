//! Request/response client on the control channel.
//!
//! Requests carry a sequence number; a reader task hands each response to the
//! waiter registered under that number. When the channel dies every waiter
//! fails with `ConnectionLost`, exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use bifroest_core::codec::{read_frame, write_frame};
use bifroest_core::messages::{Call, Outcome, RemoteError, Request, Response};
use bifroest_core::{ConnectionId, ImpError, ImpResult, MuxStream};

type Waiter = oneshot::Sender<Result<Outcome, RemoteError>>;

struct Inner {
    writer: tokio::sync::Mutex<WriteHalf<MuxStream>>,
    waiters: Mutex<HashMap<u64, Waiter>>,
    next_seq: AtomicU64,
    closed: AtomicBool,
}

/// Issues calls to the imp and correlates the responses.
#[derive(Clone)]
pub(crate) struct ControlClient {
    inner: Arc<Inner>,
}

impl ControlClient {
    /// Take over the control channel; the reader runs on `tracker`.
    pub(crate) fn start(control: MuxStream, tracker: &TaskTracker) -> Self {
        let (reader, writer) = tokio::io::split(control);
        let client = Self {
            inner: Arc::new(Inner {
                writer: tokio::sync::Mutex::new(writer),
                waiters: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        };
        tracker.spawn(client.clone().read_loop(reader));
        client
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Waiter>> {
        self.inner.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send `call` and wait for its outcome.
    ///
    /// Cancelling `cancel` abandons the call with `Timeout`.
    pub(crate) async fn call(
        &self,
        cancel: &CancellationToken,
        connection_id: ConnectionId,
        call: Call,
    ) -> ImpResult<Outcome> {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters();
            if self.is_closed() {
                return Err(ImpError::ConnectionLost);
            }
            waiters.insert(seq, tx);
        }

        let name = call.name();
        trace!(seq, call = name, connection_id = %connection_id, "sending call");
        let request = Request {
            seq,
            connection_id,
            call,
        };

        let sent = tokio::select! {
            _ = cancel.cancelled() => Err(ImpError::Timeout),
            r = async {
                let mut writer = self.inner.writer.lock().await;
                write_frame(&mut *writer, &request).await
            } => r.map_err(|e| match e {
                ImpError::Io(_) => ImpError::ConnectionLost,
                other => other,
            }),
        };
        if let Err(e) = sent {
            self.waiters().remove(&seq);
            return Err(e);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                self.waiters().remove(&seq);
                return Err(ImpError::Timeout);
            }
            r = rx => r,
        };
        match response {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(remote)) => {
                debug!(seq, call = name, error = %remote.message, "call failed on imp");
                Err(remote.into())
            }
            Err(_) => Err(ImpError::ConnectionLost),
        }
    }

    async fn read_loop(self, mut reader: ReadHalf<MuxStream>) {
        loop {
            let response: Response = match read_frame(&mut reader).await {
                Ok(r) => r,
                Err(ImpError::Io(e)) if bifroest_core::is_closed_error(&e) => break,
                Err(e) => {
                    debug!(error = %e, "control channel ended");
                    break;
                }
            };
            let waiter = self.waiters().remove(&response.seq);
            match waiter {
                Some(w) => {
                    let _ = w.send(response.result);
                }
                None => trace!(seq = response.seq, "response for abandoned call"),
            }
        }

        // Dropping the senders fails every pending call with ConnectionLost.
        let mut waiters = self.waiters();
        self.inner.closed.store(true, Ordering::Release);
        waiters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bifroest_core::messages::RemoteErrorKind;
    use bifroest_core::{MuxConn, Side, Transport};
    use std::time::Duration;

    /// A fake imp answering calls on the far end of the control channel.
    async fn fake_imp(control: MuxStream, answer: fn(Call) -> Option<Result<Outcome, RemoteError>>) {
        let (mut rd, mut wr) = tokio::io::split(control);
        while let Ok(req) = read_frame::<_, Request>(&mut rd).await {
            if let Some(result) = answer(req.call) {
                let rsp = Response {
                    seq: req.seq,
                    result,
                };
                if write_frame(&mut wr, &rsp).await.is_err() {
                    break;
                }
            }
        }
    }

    fn setup(
        answer: fn(Call) -> Option<Result<Outcome, RemoteError>>,
    ) -> (ControlClient, MuxConn, MuxConn, TaskTracker) {
        let (a, b) = Transport::in_memory_pair(16 * 1024);
        let root = CancellationToken::new();
        let (master, master_control) = MuxConn::start(a, Side::Master, &root);
        let (imp, imp_control) = MuxConn::start(b, Side::Imp, &root);
        tokio::spawn(fake_imp(imp_control, answer));
        let tracker = TaskTracker::new();
        (ControlClient::start(master_control, &tracker), master, imp, tracker)
    }

    #[tokio::test]
    async fn outcome_and_remote_error() {
        let (client, _m, _i, _t) = setup(|call| match call {
            Call::Ping => Some(Ok(Outcome::Pong)),
            _ => Some(Err(RemoteError::new(RemoteErrorKind::Unsupported, "nope"))),
        });
        let cancel = CancellationToken::new();
        let pong = client.call(&cancel, ConnectionId::new(), Call::Ping).await.unwrap();
        assert_eq!(pong, Outcome::Pong);
        let err = client
            .call(&cancel, ConnectionId::new(), Call::GetEnvironment)
            .await
            .unwrap_err();
        assert!(matches!(err, ImpError::Unsupported(_)));
    }

    #[tokio::test]
    async fn cancelled_call_times_out() {
        let (client, _m, _i, _t) = setup(|_| None);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = client
            .call(&cancel, ConnectionId::new(), Call::Ping)
            .await
            .unwrap_err();
        assert!(matches!(err, ImpError::Timeout));
        assert!(client.waiters().is_empty());
    }

    #[tokio::test]
    async fn pending_calls_fail_once_when_connection_dies() {
        let (client, _m, imp, _t) = setup(|_| None);
        let cancel = CancellationToken::new();

        let calls: Vec<_> = (0..3)
            .map(|_| {
                let client = client.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { client.call(&cancel, ConnectionId::new(), Call::Ping).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        imp.close();

        for call in calls {
            let result = tokio::time::timeout(Duration::from_secs(5), call)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(result, Err(ImpError::ConnectionLost)));
        }
        let later = client.call(&cancel, ConnectionId::new(), Call::Ping).await;
        assert!(matches!(later, Err(ImpError::ConnectionLost)));
    }
}
