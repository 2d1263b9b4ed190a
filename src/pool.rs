use crate::connection::PooledConnection;
use crate::error::{DriverError, Error, Result};
use crate::guard::ConnectionHandle;
use crate::state::PoolState;
use crate::Manager;
use dark_std::sync::AtomicDuration;
use flume::{Receiver, Sender};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Pool have manager, acquire Connection from Pool
pub struct Pool<M: Manager> {
    pub manager: Arc<M>,
    idle_send: Arc<Sender<PooledConnection<M::Connection>>>,
    idle_recv: Arc<Receiver<PooledConnection<M::Connection>>>,
    max_open: Arc<AtomicU64>,
    pub(crate) in_use: Arc<AtomicU64>,
    waits: Arc<AtomicU64>,
    connecting: Arc<AtomicU64>,
    checking: Arc<AtomicU64>,
    connections: Arc<AtomicU64>,
    next_id: Arc<AtomicU64>,
    //idle connections older than this are destroyed, None disables
    idle_timeout: Arc<AtomicDuration>,
    //only check idle connections that sat at least this long, None checks always
    check_interval: Arc<AtomicDuration>,
    //timeout check connection default 5s
    timeout_check: Arc<AtomicDuration>,
    //timeout physical connect default 10s
    timeout_connect: Arc<AtomicDuration>,
    closed: CancellationToken,
    released: Arc<Notify>,
}

impl<M: Manager> Debug for Pool<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        Debug::fmt(&state, f)
    }
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            idle_send: self.idle_send.clone(),
            idle_recv: self.idle_recv.clone(),
            max_open: self.max_open.clone(),
            in_use: self.in_use.clone(),
            waits: self.waits.clone(),
            connecting: self.connecting.clone(),
            checking: self.checking.clone(),
            connections: self.connections.clone(),
            next_id: self.next_id.clone(),
            idle_timeout: self.idle_timeout.clone(),
            check_interval: self.check_interval.clone(),
            timeout_check: self.timeout_check.clone(),
            timeout_connect: self.timeout_connect.clone(),
            closed: self.closed.clone(),
            released: self.released.clone(),
        }
    }
}

impl<M: Manager> Pool<M> {
    pub fn new(m: M) -> Self {
        let default_max = num_cpus::get() as u64;
        let (s, r) = flume::unbounded();
        Self {
            manager: Arc::new(m),
            idle_send: Arc::new(s),
            idle_recv: Arc::new(r),
            max_open: Arc::new(AtomicU64::new(default_max)),
            in_use: Arc::new(AtomicU64::new(0)),
            waits: Arc::new(AtomicU64::new(0)),
            connecting: Arc::new(AtomicU64::new(0)),
            checking: Arc::new(AtomicU64::new(0)),
            connections: Arc::new(AtomicU64::new(0)),
            next_id: Arc::new(AtomicU64::new(1)),
            idle_timeout: Arc::new(AtomicDuration::new(Some(Duration::from_secs(30)))),
            check_interval: Arc::new(AtomicDuration::new(Some(Duration::from_secs(30)))),
            timeout_check: Arc::new(AtomicDuration::new(Some(Duration::from_secs(5)))),
            timeout_connect: Arc::new(AtomicDuration::new(Some(Duration::from_secs(10)))),
            closed: CancellationToken::new(),
            released: Arc::new(Notify::new()),
        }
    }

    pub async fn acquire(&self) -> Result<ConnectionHandle<M>> {
        self.acquire_timeout(None).await
    }

    /// Wait up to `d` for an idle connection or a free slot. Once a slot is
    /// claimed the handshake is bounded by the connect timeout alone, so a
    /// hanging server surfaces as [`Error::ConnectFailed`] rather than as
    /// contention. Fails with [`Error::PoolExhausted`] when nothing frees up
    /// in time and [`Error::NotConnected`] once [`drain`](Self::drain) has begun.
    pub async fn acquire_timeout(&self, d: Option<Duration>) -> Result<ConnectionHandle<M>> {
        if self.closed.is_cancelled() {
            return Err(Error::NotConnected);
        }
        self.waits.fetch_add(1, Ordering::SeqCst);
        defer!(|| {
            self.waits.fetch_sub(1, Ordering::SeqCst);
        });
        let deadline = d.map(|d| Instant::now() + d);
        loop {
            //register before looking at the counters so a release in between is not lost
            let released = self.released.notified();
            let conn = match self.idle_recv.try_recv() {
                Ok(conn) => conn,
                Err(_) => {
                    if self.try_reserve() {
                        let handle = self.open().await?;
                        return self.hand_out(handle);
                    }
                    let waited = match (deadline, d) {
                        (Some(at), Some(d)) => tokio::time::timeout_at(at, self.wait_idle(released))
                            .await
                            .map_err(|_e| Error::PoolExhausted(d))?,
                        _ => self.wait_idle(released).await,
                    };
                    match waited? {
                        Some(conn) => conn,
                        None => continue,
                    }
                }
            };
            //from here on, dropping the handle gives the slot back
            let mut handle = ConnectionHandle::new(conn, self.clone());
            if handle.pooled().is_expired(self.idle_timeout.get()) {
                handle.discard();
                continue;
            }
            if self.needs_check(handle.pooled()) {
                //a check cut short leaves the connection in an unknown state
                handle.discard();
                self.checking.fetch_add(1, Ordering::SeqCst);
                defer!(|| {
                    self.checking.fetch_sub(1, Ordering::SeqCst);
                });
                let check_timeout = self.timeout_check.get().unwrap_or(Duration::from_secs(5));
                let checked = tokio::time::timeout(check_timeout, self.manager.check(&mut *handle)).await;
                match checked {
                    Ok(Ok(())) => handle.keep(),
                    Ok(Err(e)) => {
                        tracing::debug!(connection = handle.id(), error = %e, "dropping connection that failed its check");
                        continue;
                    }
                    Err(_) => {
                        tracing::debug!(connection = handle.id(), "dropping connection whose check timed out");
                        continue;
                    }
                }
            }
            return self.hand_out(handle);
        }
    }

    /// `Ok(None)` means a slot or connection was released and the caller
    /// should look again.
    async fn wait_idle(&self, released: Notified<'_>) -> Result<Option<PooledConnection<M::Connection>>> {
        tokio::select! {
            r = self.idle_recv.recv_async() => match r {
                Ok(conn) => Ok(Some(conn)),
                Err(_) => Err(Error::NotConnected),
            },
            _ = released => Ok(None),
            _ = self.closed.cancelled() => Err(Error::NotConnected),
        }
    }

    //drain may have started while this caller was connecting or checking
    fn hand_out(&self, mut handle: ConnectionHandle<M>) -> Result<ConnectionHandle<M>> {
        if self.closed.is_cancelled() {
            handle.discard();
            return Err(Error::NotConnected);
        }
        Ok(handle)
    }

    /// Claim a connection slot if one is free. Counting the slot before the
    /// handshake keeps racing acquirers from overshooting `max_open`.
    fn try_reserve(&self) -> bool {
        let max = self.max_open.load(Ordering::SeqCst);
        self.connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    /// Establish a physical connection in a slot already claimed by
    /// `try_reserve`. The slot is given back if this fails or is cancelled.
    /// The handle is counted in `in_use` before `connecting` drops, so drain
    /// always sees the connection in one of the two.
    async fn open(&self) -> Result<ConnectionHandle<M>> {
        let reserved = AtomicBool::new(true);
        self.connecting.fetch_add(1, Ordering::SeqCst);
        defer!(|| {
            self.connecting.fetch_sub(1, Ordering::SeqCst);
            if reserved.load(Ordering::SeqCst) {
                self.release_slot();
            } else {
                self.released.notify_waiters();
            }
        });
        let connect_timeout = self.timeout_connect.get().unwrap_or(Duration::from_secs(10));
        let result = match tokio::time::timeout(connect_timeout, self.manager.connect()).await {
            Ok(r) => r,
            Err(_) => Err(DriverError::timeout(format!(
                "connect timed out after {:?}",
                connect_timeout
            ))),
        };
        match result {
            Ok(conn) => {
                reserved.store(false, Ordering::SeqCst);
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(connection = id, "opened physical connection");
                Ok(ConnectionHandle::new(PooledConnection::new(id, conn), self.clone()))
            }
            Err(e) => Err(Error::ConnectFailed(e)),
        }
    }

    fn needs_check(&self, conn: &PooledConnection<M::Connection>) -> bool {
        match self.check_interval.get() {
            Some(interval) => conn.idle_for() >= interval,
            None => true,
        }
    }

    fn release_slot(&self) {
        _ = self
            .connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.released.notify_waiters();
    }

    /// Give the slot back and close the connection in the background. Outside
    /// a runtime the connection is simply dropped.
    fn forget(&self, conn: PooledConnection<M::Connection>) {
        self.release_slot();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let manager = self.manager.clone();
                rt.spawn(async move {
                    manager.disconnect(conn.into_inner()).await;
                });
            }
            Err(_) => drop(conn),
        }
    }

    /// Return a connection to the idle set. Never blocks: connections that
    /// should not be kept are dropped instead.
    pub(crate) fn recycle(&self, mut conn: PooledConnection<M::Connection>, discard: bool) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        let over_max = self.idle_send.len() as u64 >= self.max_open.load(Ordering::SeqCst);
        if discard || over_max || self.closed.is_cancelled() {
            self.forget(conn);
            return;
        }
        conn.mark_idle();
        match self.idle_send.send(conn) {
            Ok(()) => self.released.notify_waiters(),
            Err(e) => self.forget(e.into_inner()),
        }
    }

    /// Destroy idle connections that sat unused longer than the idle timeout.
    /// Returns how many were closed.
    pub async fn reap_idle(&self) -> usize {
        let Some(timeout) = self.idle_timeout.get() else {
            return 0;
        };
        let mut expired = Vec::new();
        for _ in 0..self.idle_recv.len() {
            match self.idle_recv.try_recv() {
                Ok(conn) if conn.is_expired(Some(timeout)) => {
                    self.release_slot();
                    expired.push(conn);
                }
                Ok(conn) => {
                    if let Err(e) = self.idle_send.send(conn) {
                        self.forget(e.into_inner());
                    }
                }
                Err(_) => break,
            }
        }
        let reaped = expired.len();
        for conn in expired {
            self.manager.disconnect(conn.into_inner()).await;
        }
        if reaped > 0 {
            tracing::debug!(event = "idle_reaped", reaped, "closed idle connections");
        }
        reaped
    }

    /// Stop handing out connections, wait up to `grace` for in-flight handles
    /// to come back, then close every idle connection. Returns `true` when all
    /// handles were released within the grace period. Handles released later
    /// are closed as they come back.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.closed.cancel();
        let deadline = Instant::now() + grace;
        let all_released = loop {
            let released = self.released.notified();
            if self.settled() {
                break true;
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                break self.settled();
            }
        };
        let mut idle = Vec::new();
        while let Ok(conn) = self.idle_recv.try_recv() {
            self.release_slot();
            idle.push(conn);
        }
        let closed = idle.len();
        for conn in idle {
            self.manager.disconnect(conn.into_inner()).await;
        }
        tracing::info!(
            event = "pool_drained",
            closed,
            all_released,
            still_in_use = self.in_use.load(Ordering::SeqCst),
            "connection pool drained"
        );
        all_released
    }

    //no handle out and no handshake in progress
    fn settled(&self) -> bool {
        self.in_use.load(Ordering::SeqCst) == 0 && self.connecting.load(Ordering::SeqCst) == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn state(&self) -> PoolState {
        PoolState {
            max_open: self.max_open.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            in_use: self.in_use.load(Ordering::SeqCst),
            idle: self.idle_send.len() as u64,
            waits: self.waits.load(Ordering::SeqCst),
            connecting: self.connecting.load(Ordering::SeqCst),
            checking: self.checking.load(Ordering::SeqCst),
            closed: self.closed.is_cancelled(),
        }
    }

    pub fn set_max_open(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.max_open.store(n, Ordering::SeqCst);
        while self.idle_send.len() > n as usize {
            match self.idle_recv.try_recv() {
                Ok(conn) => self.forget(conn),
                Err(_) => break,
            }
        }
    }

    pub fn get_max_open(&self) -> u64 {
        self.max_open.load(Ordering::SeqCst)
    }

    /// Set how long a connection may stay idle before it is destroyed.
    pub fn set_idle_timeout(&self, duration: Option<Duration>) {
        self.idle_timeout.store(duration);
    }

    pub fn get_idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout.get()
    }

    /// Set how long a connection must be idle before acquire checks it.
    pub fn set_check_interval(&self, duration: Option<Duration>) {
        self.check_interval.store(duration);
    }

    /// Set the timeout for checking connections in the pool.
    pub fn set_timeout_check(&self, duration: Option<Duration>) {
        self.timeout_check.store(duration);
    }

    /// Get the timeout for checking connections in the pool.
    pub fn get_timeout_check(&self) -> Option<Duration> {
        self.timeout_check.get()
    }

    /// Set the timeout for establishing a physical connection.
    pub fn set_timeout_connect(&self, duration: Option<Duration>) {
        self.timeout_connect.store(duration);
    }
}
