//! Gateway-side actor: dials imps, authenticates them and keeps one live
//! [`Session`] per login.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bifroest_core::handshake::{self, MasterHandshake};
use bifroest_core::{
    fingerprint, AccessToken, Endpoint, ImpError, ImpResult, KeyedMutex, MuxConn, PrivateKey,
    PublicKey, Restriction, SessionId, Side,
};

use crate::session::Session;

/// Default limit for dialing plus handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Where an imp lives and which key it must present.
#[derive(Debug, Clone)]
pub struct Ref {
    /// Expected imp key. `None` accepts any key allowed by the restriction.
    pub public_key: Option<PublicKey>,
    pub endpoint: Endpoint,
}

impl Ref {
    pub fn new(public_key: PublicKey, endpoint: Endpoint) -> Self {
        Self {
            public_key: Some(public_key),
            endpoint,
        }
    }
}

/// Opens and tracks sessions towards imps.
pub struct Master {
    key: Option<PrivateKey>,
    restriction: Restriction,
    token: Option<AccessToken>,
    handshake_timeout: Duration,
    sessions: Arc<Mutex<HashMap<SessionId, Session>>>,
    opening: KeyedMutex<SessionId>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Master {
    /// A master that proves its identity with `key`.
    pub fn new(key: PrivateKey) -> Self {
        Self::build(Some(key))
    }

    /// A master without an identity. Only imps that explicitly allow
    /// unauthenticated masters will accept it.
    pub fn new_unauthenticated() -> Self {
        warn!("master runs unauthenticated; imps cannot verify who is connecting");
        Self::build(None)
    }

    fn build(key: Option<PrivateKey>) -> Self {
        Self {
            key,
            restriction: Restriction::default(),
            token: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            sessions: Arc::default(),
            opening: KeyedMutex::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Minimum strength required of imp keys.
    pub fn with_restriction(mut self, restriction: Restriction) -> Self {
        self.restriction = restriction;
        self
    }

    /// Present `token` to imps that require one.
    pub fn with_access_token(mut self, token: AccessToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// The key imps must be provisioned with, if any.
    pub fn public_key(&self) -> Option<&PublicKey> {
        self.key.as_ref().map(|k| k.public_key())
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Session>> {
        lock_sessions(&self.sessions)
    }

    /// The live session for `id`, if there is one.
    pub fn session(&self, id: &SessionId) -> Option<Session> {
        self.sessions().get(id).filter(|s| !s.is_closed()).cloned()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions().values().filter(|s| !s.is_closed()).count()
    }

    /// Connect to the imp behind `target` and authenticate it.
    ///
    /// Returns the existing session when `session_id` already has a live one.
    /// Fails with `Unreachable` when the imp cannot be reached,
    /// `AuthenticationFailed` when either side rejects the other and `Timeout`
    /// when `cancel` fires or the handshake takes too long.
    pub async fn open(
        &self,
        cancel: &CancellationToken,
        session_id: SessionId,
        target: &Ref,
    ) -> ImpResult<Session> {
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return Err(ImpError::Timeout),
            g = self.opening.lock(session_id) => g,
        };
        if self.closed.load(Ordering::Acquire) {
            return Err(ImpError::ConnectionLost);
        }
        if let Some(existing) = self.session(&session_id) {
            debug!(session_id = %session_id, "reusing live session");
            return Ok(existing);
        }

        let (conn, control, imp_key) = tokio::select! {
            _ = cancel.cancelled() => return Err(ImpError::Timeout),
            _ = self.cancel.cancelled() => return Err(ImpError::ConnectionLost),
            r = time::timeout(self.handshake_timeout, self.connect(cancel, session_id, target)) => {
                r.map_err(|_| ImpError::Timeout)??
            }
        };

        let session = Session::start(session_id, imp_key, conn, control);
        let replaced = self.sessions().insert(session_id, session.clone());
        self.evict_when_closed(&session);
        if let Some(old) = replaced {
            old.close().await;
        }
        info!(
            session_id = %session_id,
            endpoint = %target.endpoint,
            "opened session to imp"
        );
        Ok(session)
    }

    async fn connect(
        &self,
        cancel: &CancellationToken,
        session_id: SessionId,
        target: &Ref,
    ) -> ImpResult<(MuxConn, bifroest_core::MuxStream, PublicKey)> {
        let transport = target.endpoint.dial(cancel).await?;
        let params = MasterHandshake {
            session_id,
            key: self.key.as_ref(),
            expected_imp: target.public_key.as_ref(),
            restriction: &self.restriction,
            token: self.token.as_ref(),
        };
        let (transport, imp_key) = handshake::initiate(transport, params)
            .await
            .map_err(|e| match e {
                ImpError::Io(e) => ImpError::Unreachable(format!(
                    "{} hung up during handshake: {e}",
                    target.endpoint
                )),
                other => other,
            })?;
        debug!(
            session_id = %session_id,
            imp = %fingerprint(&imp_key),
            "imp authenticated"
        );
        let (conn, control) = MuxConn::start(transport, Side::Master, &self.cancel);
        Ok((conn, control, imp_key))
    }

    /// Drop the registry entry of `session` once its connection is gone.
    fn evict_when_closed(&self, session: &Session) {
        let sessions = Arc::downgrade(&self.sessions);
        let session = session.clone();
        tokio::spawn(async move {
            session.closed().await;
            let Some(sessions) = sessions.upgrade() else {
                return;
            };
            let mut map = lock_sessions(&sessions);
            if map.get(&session.id()).is_some_and(|s| s.same_as(&session)) {
                map.remove(&session.id());
                debug!(session_id = %session.id(), "session closed and evicted");
            }
        });
    }

    /// Close every session. Idempotent; later opens fail with `ConnectionLost`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let sessions: Vec<Session> = self.sessions().drain().map(|(_, s)| s).collect();
        debug!(count = sessions.len(), "closing master");
        for session in sessions {
            session.close().await;
        }
    }
}

fn lock_sessions(
    sessions: &Mutex<HashMap<SessionId, Session>>,
) -> std::sync::MutexGuard<'_, HashMap<SessionId, Session>> {
    sessions.lock().unwrap_or_else(|e| e.into_inner())
}

impl Drop for Master {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bifroest_core::codec::{read_frame, write_frame};
    use bifroest_core::handshake::ImpHandshake;
    use bifroest_core::messages::{Request, Response};
    use bifroest_core::{KeyRequirement, Outcome, Transport};
    use tokio::net::TcpListener;

    fn key() -> PrivateKey {
        KeyRequirement::default().generate().unwrap()
    }

    /// A minimal imp: authenticates one master per accepted connection and
    /// answers every call with `Pong`.
    async fn fake_imp(imp_key: PrivateKey, anchor: Option<PublicKey>) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let restriction = Restriction::default();
            while let Ok((tcp, _)) = listener.accept().await {
                let transport = Transport::tcp(tcp);
                let params = ImpHandshake {
                    key: &imp_key,
                    trust_anchor: anchor.as_ref(),
                    restriction: &restriction,
                    token: None,
                    allow_unauthenticated: anchor.is_none(),
                };
                let Ok((transport, _)) = handshake::respond(transport, params).await else {
                    continue;
                };
                let root = CancellationToken::new();
                let (_conn, control) = MuxConn::start(transport, Side::Imp, &root);
                let (mut rd, mut wr) = tokio::io::split(control);
                while let Ok(req) = read_frame::<_, Request>(&mut rd).await {
                    let rsp = Response {
                        seq: req.seq,
                        result: Ok(Outcome::Pong),
                    };
                    if write_frame(&mut wr, &rsp).await.is_err() {
                        break;
                    }
                }
            }
        });
        Endpoint::tcp(addr.to_string())
    }

    #[tokio::test]
    async fn open_ping_and_reuse() {
        let master_key = key();
        let imp_key = key();
        let imp_public = imp_key.public_key().clone();
        let endpoint = fake_imp(imp_key, Some(master_key.public_key().clone())).await;
        let master = Master::new(master_key);
        let target = Ref::new(imp_public, endpoint);
        let cancel = CancellationToken::new();
        let sid = SessionId::new();

        let session = master.open(&cancel, sid, &target).await.unwrap();
        session
            .ping(&cancel, bifroest_core::ConnectionId::new())
            .await
            .unwrap();

        let again = master.open(&cancel, sid, &target).await.unwrap();
        assert_eq!(again.id(), session.id());
        assert_eq!(master.session_count(), 1);

        master.close().await;
        assert!(session.is_closed());
        master.close().await;
        let err = master.open(&cancel, SessionId::new(), &target).await.unwrap_err();
        assert!(matches!(err, ImpError::ConnectionLost));
    }

    #[tokio::test]
    async fn closed_sessions_are_evicted() {
        let master_key = key();
        let imp_key = key();
        let imp_public = imp_key.public_key().clone();
        let endpoint = fake_imp(imp_key, Some(master_key.public_key().clone())).await;
        let master = Master::new(master_key);
        let target = Ref::new(imp_public, endpoint);
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            let session = master.open(&cancel, SessionId::new(), &target).await.unwrap();
            session.close().await;
        }
        assert_eq!(master.session_count(), 0);
        time::timeout(Duration::from_secs(5), async {
            while !master.sessions().is_empty() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("closed sessions stay registered");
        master.close().await;
    }

    #[tokio::test]
    async fn replaced_session_keeps_its_successor_registered() {
        let master_key = key();
        let imp_key = key();
        let imp_public = imp_key.public_key().clone();
        let endpoint = fake_imp(imp_key, Some(master_key.public_key().clone())).await;
        let master = Master::new(master_key);
        let target = Ref::new(imp_public, endpoint);
        let cancel = CancellationToken::new();
        let sid = SessionId::new();

        let first = master.open(&cancel, sid, &target).await.unwrap();
        first.close().await;
        let second = master.open(&cancel, sid, &target).await.unwrap();
        assert!(!second.same_as(&first));
        time::sleep(Duration::from_millis(50)).await;
        assert!(master.session(&sid).is_some_and(|s| s.same_as(&second)));
        master.close().await;
    }

    #[tokio::test]
    async fn wrong_imp_key_fails_authentication() {
        let master_key = key();
        let endpoint = fake_imp(key(), Some(master_key.public_key().clone())).await;
        let master = Master::new(master_key);
        let target = Ref::new(key().public_key().clone(), endpoint);
        let err = master
            .open(&CancellationToken::new(), SessionId::new(), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, ImpError::AuthenticationFailed(_)));
        assert_eq!(master.session_count(), 0);
    }

    #[tokio::test]
    async fn untrusted_master_fails_authentication() {
        let endpoint = fake_imp(key(), Some(key().public_key().clone())).await;
        let master = Master::new(key());
        let target = Ref {
            public_key: None,
            endpoint,
        };
        let err = master
            .open(&CancellationToken::new(), SessionId::new(), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, ImpError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn unauthenticated_master() {
        let imp_key = key();
        let imp_public = imp_key.public_key().clone();
        let endpoint = fake_imp(imp_key, None).await;
        let master = Master::new_unauthenticated();
        assert!(master.public_key().is_none());
        let session = master
            .open(&CancellationToken::new(), SessionId::new(), &Ref::new(imp_public, endpoint))
            .await
            .unwrap();
        assert!(!session.is_closed());
        master.close().await;
    }

    #[tokio::test]
    async fn unreachable_endpoint() {
        // Bind and drop to get a port nobody listens on.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let master = Master::new(key());
        let target = Ref::new(key().public_key().clone(), Endpoint::tcp(addr.to_string()));
        let err = master
            .open(&CancellationToken::new(), SessionId::new(), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, ImpError::Unreachable(_)));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_tcp, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });
        let master = Master::new(key()).with_handshake_timeout(Duration::from_millis(100));
        let target = Ref::new(key().public_key().clone(), Endpoint::tcp(addr.to_string()));
        let err = master
            .open(&CancellationToken::new(), SessionId::new(), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, ImpError::Timeout));
    }

    #[tokio::test]
    async fn cancelled_open_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_tcp, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });
        let master = Master::new(key());
        let target = Ref::new(key().public_key().clone(), Endpoint::tcp(addr.to_string()));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = master.open(&cancel, SessionId::new(), &target).await.unwrap_err();
        assert!(matches!(err, ImpError::Timeout));
    }
}
