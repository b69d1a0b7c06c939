//! In-memory TUN devices for tests and loopback scenarios.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{TunDevice, TunManager};

const QUEUE_DEPTH: usize = 1024;

/// Channel-backed [`TunDevice`]. Packets written with `send` travel to a
/// linked queue: either a paired device (`pair`) or this device's own
/// inbound queue (`echo`).
pub struct MemoryTun {
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
    closed: CancellationToken,
}

impl MemoryTun {
    /// Two linked devices: packets sent on one are received on the other.
    /// The first half plays the kernel side in tests, the second is handed
    /// to the code under test.
    pub fn pair() -> (Arc<MemoryTun>, Arc<MemoryTun>) {
        let (a_tx, a_rx) = mpsc::channel(QUEUE_DEPTH);
        let (b_tx, b_rx) = mpsc::channel(QUEUE_DEPTH);
        let a = Arc::new(MemoryTun {
            inbound: tokio::sync::Mutex::new(a_rx),
            outbound: b_tx,
            closed: CancellationToken::new(),
        });
        let b = Arc::new(MemoryTun {
            inbound: tokio::sync::Mutex::new(b_rx),
            outbound: a_tx,
            closed: CancellationToken::new(),
        });
        (a, b)
    }

    /// A device that reflects every written packet back out of its own
    /// read side, byte for byte.
    pub fn echo() -> Arc<MemoryTun> {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        Arc::new(MemoryTun {
            inbound: tokio::sync::Mutex::new(rx),
            outbound: tx,
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl TunDevice for MemoryTun {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Ok(0);
        }
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(0),
            pkt = inbound.recv() => match pkt {
                Some(pkt) => {
                    if pkt.len() > buf.len() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "packet larger than read buffer",
                        ));
                    }
                    buf[..pkt.len()].copy_from_slice(&pkt);
                    Ok(pkt.len())
                }
                // All senders gone: the link is down.
                None => Ok(0),
            },
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device closed"));
        }
        self.outbound
            .send(packet.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer device gone"))?;
        Ok(packet.len())
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

/// [`TunManager`] handing out preloaded [`MemoryTun`] devices.
///
/// Tests push the device halves they want the code under test to receive;
/// `dispose_devices` closes everything handed out so far and counts its
/// own invocations so idempotence is observable.
pub struct MemoryTunManager {
    queue: Mutex<Vec<Arc<MemoryTun>>>,
    handed_out: Mutex<Vec<Arc<MemoryTun>>>,
    dispose_calls: AtomicUsize,
    route_endpoint: Mutex<Option<SocketAddr>>,
}

impl MemoryTunManager {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryTunManager {
            queue: Mutex::new(Vec::new()),
            handed_out: Mutex::new(Vec::new()),
            dispose_calls: AtomicUsize::new(0),
            route_endpoint: Mutex::new(None),
        })
    }

    /// Queue a device for the next `create_device` call.
    pub fn push_device(&self, dev: Arc<MemoryTun>) {
        self.queue.lock().unwrap().push(dev);
    }

    pub fn dispose_calls(&self) -> usize {
        self.dispose_calls.load(Ordering::SeqCst)
    }

    pub fn route_endpoint(&self) -> Option<SocketAddr> {
        *self.route_endpoint.lock().unwrap()
    }
}

#[async_trait]
impl TunManager for MemoryTunManager {
    async fn create_device(&self) -> io::Result<Arc<dyn TunDevice>> {
        let dev = self.queue.lock().unwrap().pop().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no queued memory device")
        })?;
        self.handed_out.lock().unwrap().push(dev.clone());
        Ok(dev)
    }

    async fn dispose_devices(&self) {
        self.dispose_calls.fetch_add(1, Ordering::SeqCst);
        let devices: Vec<_> = self.handed_out.lock().unwrap().drain(..).collect();
        for dev in devices {
            dev.close().await;
        }
    }

    async fn set_route_endpoint(&self, addr: SocketAddr) {
        *self.route_endpoint.lock().unwrap() = Some(addr);
    }
}
