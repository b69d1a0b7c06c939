//! The per-client session registry.
//!
//! Keyed by the peer's tunnel IP, which the TUN-read dispatch extracts
//! from decrypted inner packets. Lookups dominate writes, so the map sits
//! behind a plain read-write lock and entries carry their own lock for
//! activity tracking.
//!
//! An IP slot is reserved mid-handshake, before the server commits to a
//! reply, so a second client claiming the same address fails its handshake
//! while the first session runs undisturbed. Reservations release
//! themselves when dropped, which also covers handshakes abandoned by a
//! deadline.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tundev::Clock;
use tungo_core::session::{short_id, SessionId};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("tunnel ip {0} already in use")]
    Occupied(IpAddr),
}

/// One registered client session.
pub struct ClientEntry {
    pub tunnel_ip: IpAddr,
    pub session_id: SessionId,
    /// Plaintext packets headed to this client; the session's egress task
    /// drains it.
    pub outbound: mpsc::Sender<Vec<u8>>,
    /// Datagram peers only; stream peers are addressed by their socket.
    pub peer_addr: Option<SocketAddr>,
    pub cancel: CancellationToken,
    last_activity: Mutex<Instant>,
    clock: Arc<dyn Clock>,
}

impl ClientEntry {
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = self.clock.now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }
}

enum Slot {
    Reserved,
    Live(Arc<ClientEntry>),
}

pub struct SessionRegistry {
    slots: RwLock<HashMap<IpAddr, Slot>>,
    clock: Arc<dyn Clock>,
}

impl SessionRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry {
            slots: RwLock::new(HashMap::new()),
            clock,
        })
    }

    /// Claim `ip` for a handshake in flight. Fails if any session or
    /// other handshake holds it.
    pub fn reserve(self: &Arc<Self>, ip: IpAddr) -> Result<Reservation, RegistryError> {
        let mut slots = self.slots.write().unwrap();
        if slots.contains_key(&ip) {
            return Err(RegistryError::Occupied(ip));
        }
        slots.insert(ip, Slot::Reserved);
        Ok(Reservation {
            registry: self.clone(),
            ip,
            armed: true,
        })
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<Arc<ClientEntry>> {
        match self.slots.read().unwrap().get(&ip) {
            Some(Slot::Live(entry)) => Some(entry.clone()),
            _ => None,
        }
    }

    /// Drop the slot. Returns the entry if a live session held it, so the
    /// caller can cancel it.
    pub fn release(&self, ip: IpAddr) -> Option<Arc<ClientEntry>> {
        match self.slots.write().unwrap().remove(&ip) {
            Some(Slot::Live(entry)) => Some(entry),
            _ => None,
        }
    }

    /// Drop the slot only if `entry` still owns it. Session tasks use this
    /// on the way out so a late cleanup cannot evict a successor that
    /// re-registered the same address.
    pub fn release_entry(&self, entry: &Arc<ClientEntry>) -> bool {
        let mut slots = self.slots.write().unwrap();
        if let Some(Slot::Live(live)) = slots.get(&entry.tunnel_ip) {
            if Arc::ptr_eq(live, entry) {
                slots.remove(&entry.tunnel_ip);
                return true;
            }
        }
        false
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .read()
            .unwrap()
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    fn activate(
        &self,
        ip: IpAddr,
        session_id: SessionId,
        outbound: mpsc::Sender<Vec<u8>>,
        peer_addr: Option<SocketAddr>,
        cancel: CancellationToken,
    ) -> Arc<ClientEntry> {
        let entry = Arc::new(ClientEntry {
            tunnel_ip: ip,
            session_id,
            outbound,
            peer_addr,
            cancel,
            last_activity: Mutex::new(self.clock.now()),
            clock: self.clock.clone(),
        });
        self.slots
            .write()
            .unwrap()
            .insert(ip, Slot::Live(entry.clone()));
        debug!(session = %short_id(&session_id), ip = %ip, "session registered");
        entry
    }
}

/// A claimed-but-not-yet-live IP slot. Dropping it releases the slot, so
/// abandoned handshakes cannot squat on an address.
pub struct Reservation {
    registry: Arc<SessionRegistry>,
    ip: IpAddr,
    armed: bool,
}

impl Reservation {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Turn the reservation into a live registry entry.
    pub fn into_active(
        mut self,
        session_id: SessionId,
        outbound: mpsc::Sender<Vec<u8>>,
        peer_addr: Option<SocketAddr>,
        cancel: CancellationToken,
    ) -> Arc<ClientEntry> {
        self.armed = false;
        self.registry
            .activate(self.ip, session_id, outbound, peer_addr, cancel)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.registry.release(self.ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tundev::SystemClock;

    fn registry() -> Arc<SessionRegistry> {
        SessionRegistry::new(Arc::new(SystemClock))
    }

    fn activate(reservation: Reservation) -> Arc<ClientEntry> {
        let (tx, _rx) = mpsc::channel(1);
        reservation.into_active([1u8; 32], tx, None, CancellationToken::new())
    }

    #[test]
    fn double_claims_are_rejected() {
        let registry = registry();
        let ip: IpAddr = "10.0.0.2".parse().unwrap();

        let first = registry.reserve(ip).unwrap();
        assert!(matches!(
            registry.reserve(ip),
            Err(RegistryError::Occupied(_))
        ));

        let entry = activate(first);
        assert!(registry.reserve(ip).is_err());
        assert_eq!(registry.lookup(ip).unwrap().session_id, entry.session_id);
    }

    #[test]
    fn dropped_reservations_free_the_slot() {
        let registry = registry();
        let ip: IpAddr = "10.0.0.2".parse().unwrap();

        drop(registry.reserve(ip).unwrap());
        let second = registry.reserve(ip).unwrap();
        activate(second);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn release_returns_the_live_entry() {
        let registry = registry();
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        activate(registry.reserve(ip).unwrap());

        let released = registry.release(ip).expect("live entry");
        assert_eq!(released.tunnel_ip, ip);
        assert!(registry.lookup(ip).is_none());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn reserved_slots_do_not_resolve_lookups() {
        let registry = registry();
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        let _reservation = registry.reserve(ip).unwrap();
        assert!(registry.lookup(ip).is_none());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn touch_moves_last_activity_forward() {
        let registry = registry();
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        let entry = activate(registry.reserve(ip).unwrap());
        let before = entry.last_activity();
        std::thread::sleep(std::time::Duration::from_millis(5));
        entry.touch();
        assert!(entry.last_activity() > before);
    }
}
