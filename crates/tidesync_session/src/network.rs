//! Connectivity gate shared by every session in the process.
//!
//! Listeners are stored in a copy-on-write list: notification iterates a
//! snapshot, so listeners may add or remove themselves (or others) while a
//! transition is being delivered.

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Receives connectivity transitions.
///
/// A listener may call back into the gate, including
/// [`NetworkGate::set_online`]. A transition raised from inside a listener is
/// delivered to every listener after the current one has been.
pub trait ConnectivityListener: Send + Sync {
    /// Called with the new connectivity after every transition.
    fn on_change(&self, online: bool);
}

impl<F> ConnectivityListener for F
where
    F: Fn(bool) + Send + Sync,
{
    fn on_change(&self, online: bool) {
        self(online)
    }
}

/// Handle returned by [`NetworkGate::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerList = Arc<Vec<(ListenerId, Arc<dyn ConnectivityListener>)>>;

/// Tracks whether the device is online and broadcasts transitions.
///
/// Construct one per process and share it by reference (or `Arc`). A listener
/// that is never removed is retained for the lifetime of the gate together
/// with everything it captures.
pub struct NetworkGate {
    online: AtomicBool,
    listeners: RwLock<ListenerList>,
    next_id: AtomicU64,
    delivery: Mutex<Delivery>,
}

/// Transitions waiting to be delivered. Only one thread delivers at a time.
#[derive(Default)]
struct Delivery {
    pending: VecDeque<bool>,
    running: bool,
}

impl NetworkGate {
    /// Creates a gate with the given initial connectivity.
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            listeners: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
            delivery: Mutex::new(Delivery::default()),
        }
    }

    /// Returns true if the device is currently online.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Registers a listener.
    pub fn add_listener(&self, listener: Arc<dyn ConnectivityListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write();
        let mut next = Vec::with_capacity(listeners.len() + 1);
        next.extend(listeners.iter().cloned());
        next.push((id, listener));
        *listeners = Arc::new(next);
        id
    }

    /// Unregisters a listener.
    ///
    /// Returns false if the listener was already removed.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        if !listeners.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        let next: Vec<_> = listeners
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        *listeners = Arc::new(next);
        true
    }

    /// Returns the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Records the current connectivity.
    ///
    /// Listeners are notified only if connectivity actually changed.
    /// Transitions are delivered one at a time, in the order they were
    /// recorded. If another call is already delivering, the transition is
    /// queued for that call and this one returns without waiting.
    pub fn set_online(&self, online: bool) {
        {
            let mut delivery = self.delivery.lock();
            if self.online.swap(online, Ordering::SeqCst) == online {
                return;
            }
            delivery.pending.push_back(online);
            if delivery.running {
                return;
            }
            delivery.running = true;
        }

        loop {
            let next = {
                let mut delivery = self.delivery.lock();
                match delivery.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        delivery.running = false;
                        return;
                    }
                }
            };
            let snapshot = Arc::clone(&*self.listeners.read());
            debug!(online = next, listeners = snapshot.len(), "connectivity changed");
            for (_, listener) in snapshot.iter() {
                listener.on_change(next);
            }
        }
    }
}

impl Default for NetworkGate {
    fn default() -> Self {
        Self::new(true)
    }
}

impl std::fmt::Debug for NetworkGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkGate")
            .field("online", &self.is_online())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
