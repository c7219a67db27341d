use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connection::Connection;
use crate::context::{SessionContext, Stats, StatsSnapshot};
use crate::handler::Handler;
use crate::session::Session;
use crate::shutdown::Trigger;

/// Accepts client connections and runs a session for each of them.
///
/// `Server` is a cheap handle: clones share the same listener state, registry and shutdown
/// signal, so one clone can serve while another closes it.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    handler: Option<Arc<dyn Handler>>,
    sessions: RwLock<HashMap<SocketAddr, Entry>>,
    // Sessions spawned and not finished yet. Unlike the registry, it also counts sessions that
    // lost their registry slot to a newer one with the same address.
    live: AtomicUsize,
    drained: Notify,
    shutdown: Trigger,
    local_addr: Mutex<Option<SocketAddr>>,
}

struct Entry {
    id: Uuid,
    stats: Arc<Stats>,
    stop: Trigger,
}

/// A registered session, as seen from outside its task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    pub stats: StatsSnapshot,
}

impl Server {
    /// A server with no handler: every command is answered with an error and its connection
    /// closed.
    pub fn new(config: Config) -> Server {
        Server::build(config, None)
    }

    pub fn with_handler(config: Config, handler: impl Handler + 'static) -> Server {
        Server::build(config, Some(Arc::new(handler)))
    }

    fn build(config: Config, handler: Option<Arc<dyn Handler>>) -> Server {
        Server {
            shared: Arc::new(Shared {
                config: config.normalized(),
                handler,
                sessions: RwLock::new(HashMap::new()),
                live: AtomicUsize::new(0),
                drained: Notify::new(),
                shutdown: Trigger::new(),
                local_addr: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Binds the configured address and serves until the server is closed.
    pub async fn serve(&self) -> crate::Result<()> {
        let listener = TcpListener::bind(&self.shared.config.addr).await?;
        self.serve_listener(listener).await
    }

    /// Serves on an already bound listener until the server is closed or accepting fails with
    /// a non-transient error. Returns `Ok` only once the server has been closed. The listener is
    /// dropped on return.
    pub async fn serve_listener(&self, listener: TcpListener) -> crate::Result<()> {
        let local_addr = listener.local_addr()?;
        *self
            .shared
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(local_addr);

        info!("beam server listening on {}", local_addr);

        let config = &self.shared.config;
        let mut shutdown = self.shared.shutdown.subscribe();
        let mut backoff = Backoff::new(config.accept_backoff, config.max_accept_backoff);

        while !shutdown.is_shutdown() {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = shutdown.recv() => break,
            };

            match accepted {
                Ok((socket, remote_addr)) => {
                    backoff.reset();
                    self.spawn_session(socket, remote_addr);
                }
                Err(err) if is_transient(&err) => {
                    let delay = backoff.fail();
                    warn!(cause = %err, ?delay, "failed to accept connection, retrying");
                    tokio::select! {
                        _ = time::sleep(delay) => {}
                        _ = shutdown.recv() => break,
                    }
                }
                Err(err) => {
                    error!(cause = %err, "failed to accept connection");
                    return Err(err.into());
                }
            }
        }

        info!("stopped accepting connections");
        Ok(())
    }

    /// Address the listener is bound to, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .shared
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Signals the accept loop and every session to stop. Calling it again does nothing.
    pub fn close(&self) {
        if self.shared.shutdown.fire() {
            info!(sessions = self.session_count(), "closing server");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_fired()
    }

    /// Waits until no session is running.
    pub async fn wait_drained(&self) {
        loop {
            let drained = self.shared.drained.notified();
            tokio::pin!(drained);
            // Registers interest before checking, so a wake-up between the check and the
            // await is not lost.
            drained.as_mut().enable();

            if self.shared.live.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }

    /// [`Server::close`] followed by [`Server::wait_drained`].
    pub async fn shutdown(&self) {
        self.close();
        self.wait_drained().await;
    }

    pub fn session_count(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.shared
            .read_sessions()
            .iter()
            .map(|(addr, entry)| entry.info(*addr))
            .collect()
    }

    pub fn session(&self, remote_addr: SocketAddr) -> Option<SessionInfo> {
        self.shared
            .read_sessions()
            .get(&remote_addr)
            .map(|entry| entry.info(remote_addr))
    }

    /// Asks the session of `remote_addr` to stop. It exits before its next read, once the
    /// current one returns or times out. Returns whether such a session was registered.
    pub fn disconnect(&self, remote_addr: SocketAddr) -> bool {
        match self.shared.read_sessions().get(&remote_addr) {
            Some(entry) => {
                entry.stop.fire();
                true
            }
            None => false,
        }
    }

    fn spawn_session(&self, socket: TcpStream, remote_addr: SocketAddr) {
        let config = &self.shared.config;
        let context = SessionContext::new(remote_addr);
        let id = context.id();
        let stop = Trigger::new();

        let session = Session::new(
            Connection::new(socket, config.buffer_size),
            context,
            self.shared.handler.clone(),
            self.shared.shutdown.subscribe(),
            stop.subscribe(),
            config,
        );
        let entry = Entry {
            id,
            stats: session.context().stats_handle(),
            stop,
        };
        let guard = SessionGuard::register(Arc::clone(&self.shared), remote_addr, entry);

        tokio::spawn(supervise(session, guard, id, remote_addr));
    }
}

impl Shared {
    fn read_sessions(&self) -> RwLockReadGuard<'_, HashMap<SocketAddr, Entry>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_sessions(&self) -> RwLockWriteGuard<'_, HashMap<SocketAddr, Entry>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Entry {
    fn info(&self, remote_addr: SocketAddr) -> SessionInfo {
        SessionInfo {
            id: self.id,
            remote_addr,
            stats: self.stats.snapshot(),
        }
    }
}

// Registers a session and counts it as live for as long as it exists.
struct SessionGuard {
    shared: Arc<Shared>,
    remote_addr: SocketAddr,
    id: Uuid,
}

impl SessionGuard {
    fn register(shared: Arc<Shared>, remote_addr: SocketAddr, entry: Entry) -> SessionGuard {
        let id = entry.id;
        shared.live.fetch_add(1, Ordering::AcqRel);
        if let Some(previous) = shared.write_sessions().insert(remote_addr, entry) {
            warn!(%remote_addr, previous = %previous.id, "replacing registered session");
        }

        SessionGuard {
            shared,
            remote_addr,
            id,
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        {
            let mut sessions = self.shared.write_sessions();
            if sessions
                .get(&self.remote_addr)
                .is_some_and(|entry| entry.id == self.id)
            {
                sessions.remove(&self.remote_addr);
            }
        }

        if self.shared.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.drained.notify_waiters();
        }
    }
}

#[instrument(name = "session", skip_all, fields(session_id = %id, client_address = %remote_addr))]
async fn supervise(session: Session, guard: SessionGuard, id: Uuid, remote_addr: SocketAddr) {
    let _guard = guard;
    info!("accepted connection");

    match AssertUnwindSafe(session.run()).catch_unwind().await {
        Ok(Ok(exit)) => info!(%exit, "connection closed"),
        Ok(Err(err)) => error!(cause = %err, "connection closed with error"),
        Err(panic) => error!(panic = panic_message(&*panic), "session panicked"),
    }
}

// Retry delay after transient accept errors: doubles up to `max`, back to `base` on success.
struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Backoff {
        Backoff {
            base,
            max,
            current: base,
        }
    }

    // Delay to wait now. The next failure waits twice as long.
    fn fail(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

// Accept errors that say nothing about the listener itself: a client gave up during the
// handshake, or the process ran out of descriptors or memory for a moment.
fn is_transient(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    if matches!(
        err.kind(),
        ConnectionAborted
            | ConnectionReset
            | ConnectionRefused
            | Interrupted
            | WouldBlock
            | TimedOut
            | OutOfMemory
    ) {
        return true;
    }

    matches!(err.raw_os_error(), Some(code) if RESOURCE_EXHAUSTION.contains(&code))
}

// ENOMEM, ENFILE, EMFILE, ENOBUFS
#[cfg(target_os = "linux")]
const RESOURCE_EXHAUSTION: &[i32] = &[12, 23, 24, 105];
#[cfg(target_os = "macos")]
const RESOURCE_EXHAUSTION: &[i32] = &[12, 23, 24, 55];
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
const RESOURCE_EXHAUSTION: &[i32] = &[];
