//! Control-channel call handlers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use bifroest_core::{Call, ConnectionId, ImpError, ImpResult, KeyedMutex, Outcome, Signal};

/// Answers calls arriving on the control channel.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    kills: Arc<KeyedMutex<u32>>,
    exit_code_dir: Option<PathBuf>,
}

impl Dispatcher {
    pub(crate) fn new(kills: Arc<KeyedMutex<u32>>, exit_code_dir: Option<PathBuf>) -> Self {
        Self {
            kills,
            exit_code_dir,
        }
    }

    /// Run one call. `Exit` only acknowledges here; the caller ends the session.
    pub(crate) async fn handle(&self, connection_id: ConnectionId, call: Call) -> ImpResult<Outcome> {
        match call {
            Call::Ping => Ok(Outcome::Pong),
            Call::Echo { text } => Ok(Outcome::Echoed {
                text: format!("thanks for: {text}"),
            }),
            Call::Kill { pid, signal } => {
                let _guard = self.kills.lock(pid).await;
                deliver_signal(pid, signal)?;
                info!(connection_id = %connection_id, pid, %signal, "signal delivered");
                Ok(Outcome::Killed)
            }
            Call::Exit { code } => {
                info!(connection_id = %connection_id, code, "exit requested");
                Ok(Outcome::Exiting)
            }
            Call::GetEnvironment => Ok(Outcome::Environment {
                variables: environment(),
            }),
            Call::GetConnectionExitCode => self.connection_exit_code(connection_id).await,
        }
    }

    async fn connection_exit_code(&self, connection_id: ConnectionId) -> ImpResult<Outcome> {
        let Some(dir) = &self.exit_code_dir else {
            return Err(ImpError::NotFound(
                "no exit code directory configured".into(),
            ));
        };
        let path = dir.join(connection_id.to_string());
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ImpError::NotFound(format!(
                    "no exit code recorded for connection {connection_id}"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let code = content.trim().parse::<i32>().map_err(|_| {
            ImpError::NotFound(format!(
                "exit code file {} does not hold an integer",
                path.display()
            ))
        })?;
        debug!(connection_id = %connection_id, code, "read connection exit code");
        Ok(Outcome::ExitCode { code })
    }
}

fn environment() -> BTreeMap<String, String> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

#[cfg(unix)]
fn deliver_signal(pid: u32, signal: Signal) -> ImpResult<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal as Sig};
    use nix::unistd::Pid;

    // 0 and negative values address process groups.
    let raw = i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| ImpError::InvalidParameters(format!("invalid pid {pid}")))?;
    let sig = match signal {
        Signal::Term => Sig::SIGTERM,
        Signal::Kill => Sig::SIGKILL,
        Signal::Int => Sig::SIGINT,
        Signal::Hup => Sig::SIGHUP,
        Signal::Quit => Sig::SIGQUIT,
        Signal::Usr1 => Sig::SIGUSR1,
        Signal::Usr2 => Sig::SIGUSR2,
    };
    match signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(ImpError::NoSuchProcess(pid)),
        Err(e) => Err(std::io::Error::from(e).into()),
    }
}

#[cfg(not(unix))]
fn deliver_signal(_pid: u32, signal: Signal) -> ImpResult<()> {
    Err(ImpError::Unsupported(format!(
        "cannot deliver {signal} on this platform"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(dir: Option<PathBuf>) -> Dispatcher {
        Dispatcher::new(Arc::new(KeyedMutex::new()), dir)
    }

    #[tokio::test]
    async fn echo_and_ping() {
        let d = dispatcher(None);
        let id = ConnectionId::new();
        assert_eq!(d.handle(id, Call::Ping).await.unwrap(), Outcome::Pong);
        let out = d
            .handle(id, Call::Echo { text: "foo".into() })
            .await
            .unwrap();
        assert_eq!(
            out,
            Outcome::Echoed {
                text: "thanks for: foo".into()
            }
        );
    }

    #[tokio::test]
    async fn environment_reflects_process() {
        let d = dispatcher(None);
        let Outcome::Environment { variables } =
            d.handle(ConnectionId::new(), Call::GetEnvironment).await.unwrap()
        else {
            panic!("expected environment");
        };
        let expected: BTreeMap<String, String> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        assert!(!expected.is_empty());
        assert_eq!(variables, expected);
    }

    #[tokio::test]
    async fn connection_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(Some(dir.path().to_path_buf()));
        let id = ConnectionId::new();

        let missing = d.handle(id, Call::GetConnectionExitCode).await.unwrap_err();
        assert!(matches!(missing, ImpError::NotFound(_)));

        std::fs::write(dir.path().join(id.to_string()), "42\n").unwrap();
        assert_eq!(
            d.handle(id, Call::GetConnectionExitCode).await.unwrap(),
            Outcome::ExitCode { code: 42 }
        );

        std::fs::write(dir.path().join(id.to_string()), "forty-two").unwrap();
        let garbage = d.handle(id, Call::GetConnectionExitCode).await.unwrap_err();
        assert!(matches!(garbage, ImpError::NotFound(_)));

        let unconfigured = dispatcher(None)
            .handle(id, Call::GetConnectionExitCode)
            .await
            .unwrap_err();
        assert!(matches!(unconfigured, ImpError::NotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_missing_process() {
        let d = dispatcher(None);
        // Above the default pid_max on Linux and macOS.
        let pid = 99_999_999;
        let err = d
            .handle(
                ConnectionId::new(),
                Call::Kill {
                    pid,
                    signal: Signal::Term,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ImpError::NoSuchProcess(p) if p == pid));
        assert!(d.kills.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_rejects_process_group_pids() {
        let d = dispatcher(None);
        for pid in [0, u32::MAX] {
            let err = d
                .handle(
                    ConnectionId::new(),
                    Call::Kill {
                        pid,
                        signal: Signal::Term,
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, ImpError::InvalidParameters(_)));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_child_process() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        dispatcher(None)
            .handle(
                ConnectionId::new(),
                Call::Kill {
                    pid,
                    signal: Signal::Kill,
                },
            )
            .await
            .unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
