//! TUN devices backed by the `tun` crate on unix hosts.
//!
//! Creates and tears down the interface only; address/route plumbing
//! beyond the device's own address assignment is left to platform tooling.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tun::AsyncDevice;

use crate::{TunDevice, TunManager};

pub struct OsTun {
    reader: tokio::sync::Mutex<ReadHalf<AsyncDevice>>,
    writer: tokio::sync::Mutex<WriteHalf<AsyncDevice>>,
    closed: CancellationToken,
}

#[async_trait]
impl TunDevice for OsTun {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Ok(0);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(0),
            n = reader.read(buf) => n,
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device closed"));
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(packet).await?;
        Ok(packet.len())
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

/// Parameters the manager needs to bring a device up.
#[derive(Debug, Clone)]
pub struct OsTunConfig {
    pub name: String,
    pub address: Ipv4Addr,
    pub prefix: u8,
    pub mtu: u16,
}

pub struct OsTunManager {
    config: OsTunConfig,
    devices: Mutex<Vec<Arc<OsTun>>>,
    route_endpoint: Mutex<Option<SocketAddr>>,
}

impl OsTunManager {
    pub fn new(config: OsTunConfig) -> Arc<Self> {
        Arc::new(OsTunManager {
            config,
            devices: Mutex::new(Vec::new()),
            route_endpoint: Mutex::new(None),
        })
    }
}

fn netmask(prefix: u8) -> Ipv4Addr {
    let bits = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    };
    Ipv4Addr::from(bits)
}

#[async_trait]
impl TunManager for OsTunManager {
    async fn create_device(&self) -> io::Result<Arc<dyn TunDevice>> {
        let mut config = tun::Configuration::default();
        config
            .name(&self.config.name)
            .address(self.config.address)
            .netmask(netmask(self.config.prefix))
            .mtu(i32::from(self.config.mtu))
            .up();

        #[cfg(target_os = "linux")]
        config.platform(|p| {
            p.packet_information(false);
        });

        let device = tun::create_as_async(&config)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        info!(
            name = %self.config.name,
            address = %self.config.address,
            mtu = self.config.mtu,
            "tun device up"
        );

        let (reader, writer) = tokio::io::split(device);
        let dev = Arc::new(OsTun {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            closed: CancellationToken::new(),
        });
        self.devices.lock().unwrap().push(dev.clone());
        Ok(dev)
    }

    async fn dispose_devices(&self) {
        let devices: Vec<_> = self.devices.lock().unwrap().drain(..).collect();
        for dev in devices {
            dev.close().await;
        }
    }

    async fn set_route_endpoint(&self, addr: SocketAddr) {
        debug!(%addr, "route endpoint pinned");
        *self.route_endpoint.lock().unwrap() = Some(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netmask_from_prefix() {
        assert_eq!(netmask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(netmask(16), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(netmask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(netmask(0), Ipv4Addr::new(0, 0, 0, 0));
    }
}
