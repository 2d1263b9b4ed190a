use crate::connection::PooledConnection;
use crate::{Manager, Pool};
use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Exclusive lease on one pooled connection. Dropping the handle returns the
/// connection to the pool, on every exit path.
pub struct ConnectionHandle<M: Manager> {
    inner: Option<PooledConnection<M::Connection>>,
    discard: bool,
    pool: Pool<M>,
}

impl<M: Manager> ConnectionHandle<M> {
    pub(crate) fn new(conn: PooledConnection<M::Connection>, pool: Pool<M>) -> ConnectionHandle<M> {
        pool.in_use.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: Some(conn),
            discard: false,
            pool,
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.as_ref().map(|c| c.id()).unwrap_or_default()
    }

    pub fn age(&self) -> Duration {
        self.inner.as_ref().map(|c| c.age()).unwrap_or_default()
    }

    /// Destroy the connection on release instead of returning it to the
    /// idle set. Used when its protocol state can no longer be trusted.
    pub fn discard(&mut self) {
        self.discard = true;
    }

    pub(crate) fn keep(&mut self) {
        self.discard = false;
    }

    pub(crate) fn pooled(&self) -> &PooledConnection<M::Connection> {
        match self.inner.as_ref() {
            Some(c) => c,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<M: Manager> Debug for ConnectionHandle<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id())
            .field("discard", &self.discard)
            .field("pool", &self.pool)
            .finish()
    }
}

impl<M: Manager> Deref for ConnectionHandle<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.pooled()
    }
}

impl<M: Manager> DerefMut for ConnectionHandle<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.inner.as_mut() {
            Some(c) => c,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<M: Manager> Drop for ConnectionHandle<M> {
    fn drop(&mut self) {
        if let Some(v) = self.inner.take() {
            self.pool.recycle(v, self.discard);
        }
    }
}
