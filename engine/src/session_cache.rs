//! Single-slot TLS session cache for the client role.

use parking_lot::Mutex;
use rustls::client::{ClientSessionStore, Tls12ClientSessionValue, Tls13ClientSessionValue};
use rustls::pki_types::ServerName;
use rustls::NamedGroup;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// One lock-guarded value. A replacement is installed before the previous
/// occupant is dropped, and the drop happens after the lock is released.
pub struct SessionSlot<T> {
    value: Mutex<Option<T>>,
    generation: AtomicU64,
}

impl<T> SessionSlot<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn replace(&self, value: T) {
        let old = self.value.lock().replace(value);
        self.generation.fetch_add(1, Ordering::Relaxed);
        drop(old);
    }

    /// Take the value only when `pred` accepts it.
    pub fn take_if(&self, pred: impl FnOnce(&T) -> bool) -> Option<T> {
        let mut value = self.value.lock();
        if value.as_ref().map_or(false, pred) {
            value.take()
        } else {
            None
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        f(self.value.lock().as_ref())
    }

    /// Number of replacements so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }
}

impl<T> Default for SessionSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

enum Resumable {
    Tls12(Tls12ClientSessionValue),
    Tls13(Tls13ClientSessionValue),
}

/// Holds only the most recently negotiated session of a listener. A new
/// session replaces the old one, tickets are never accumulated.
#[derive(Default)]
pub struct ResumptionCache {
    session: SessionSlot<(ServerName<'static>, Resumable)>,
    kx_hint: SessionSlot<(ServerName<'static>, NamedGroup)>,
}

impl ResumptionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.session.generation()
    }

    pub fn is_empty(&self) -> bool {
        self.session.with(|s| s.is_none())
    }
}

impl fmt::Debug for ResumptionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumptionCache")
            .field("generation", &self.generation())
            .field("empty", &self.is_empty())
            .finish()
    }
}

impl ClientSessionStore for ResumptionCache {
    fn set_kx_hint(&self, server_name: ServerName<'static>, group: NamedGroup) {
        self.kx_hint.replace((server_name, group));
    }

    fn kx_hint(&self, server_name: &ServerName<'_>) -> Option<NamedGroup> {
        self.kx_hint.with(|hint| match hint {
            Some((name, group)) if name == server_name => Some(*group),
            _ => None,
        })
    }

    fn set_tls12_session(&self, server_name: ServerName<'static>, value: Tls12ClientSessionValue) {
        self.session.replace((server_name, Resumable::Tls12(value)));
    }

    fn tls12_session(&self, server_name: &ServerName<'_>) -> Option<Tls12ClientSessionValue> {
        self.session.with(|session| match session {
            Some((name, Resumable::Tls12(value))) if name == server_name => Some(value.clone()),
            _ => None,
        })
    }

    fn remove_tls12_session(&self, server_name: &ServerName<'static>) {
        let removed = self.session.take_if(|(name, session)| {
            name == server_name && matches!(session, Resumable::Tls12(_))
        });
        drop(removed);
    }

    fn insert_tls13_ticket(&self, server_name: ServerName<'static>, value: Tls13ClientSessionValue) {
        self.session.replace((server_name, Resumable::Tls13(value)));
    }

    fn take_tls13_ticket(&self, server_name: &ServerName<'static>) -> Option<Tls13ClientSessionValue> {
        self.session
            .take_if(|(name, session)| name == server_name && matches!(session, Resumable::Tls13(_)))
            .and_then(|(_, session)| match session {
                Resumable::Tls13(value) => Some(value),
                Resumable::Tls12(_) => None,
            })
    }
}
