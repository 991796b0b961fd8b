//! Transport gateway: resource enumeration and message-based sessions.
//!
//! The bench logic only sees the [`Transport`] and [`Session`] traits. The
//! concrete gateway shipped here talks VXI-11 to LAN-attached supplies.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use tokio_vxi11::DeviceClient;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const MAX_READ: u32 = 4096;
const DEFAULT_DEVICE: &str = "inst0";

/// Opaque address of a reachable instrument endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceAddress(String);

impl ResourceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Lists addressable resources and opens sessions to them.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn list_resources(&self) -> Result<Vec<ResourceAddress>>;

    async fn open(&self, address: &ResourceAddress) -> Result<Box<dyn Session>>;
}

/// One open, message-based link to an instrument.
#[async_trait]
pub trait Session: Send {
    async fn send(&mut self, command: &str) -> Result<()>;

    async fn query(&mut self, command: &str) -> Result<String>;

    async fn close(&mut self) -> Result<()>;
}

/// One step of a scoped instrument exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    Send(String),
    Query(String),
}

/// Open a session to `address`, run `steps` in order and close it again.
///
/// Every transport call is bounded by `limit`. The first failing step aborts
/// the rest. The session is closed on every path once it has been opened.
/// Returns the replies of the `Query` steps in order.
pub async fn run_scoped(
    transport: &dyn Transport,
    address: &ResourceAddress,
    steps: &[Exchange],
    limit: Duration,
) -> Result<Vec<String>> {
    let mut session = bounded(limit, || format!("opening {address}"), transport.open(address)).await?;

    let mut replies = Vec::new();
    let mut outcome = Ok(());
    for step in steps {
        let result = match step {
            Exchange::Send(command) => {
                bounded(limit, || format!("sending {command:?}"), session.send(command)).await
            }
            Exchange::Query(command) => {
                bounded(limit, || format!("querying {command:?}"), session.query(command))
                    .await
                    .map(|reply| replies.push(reply))
            }
        };
        if let Err(e) = result {
            outcome = Err(e);
            break;
        }
    }

    if let Err(e) = bounded(limit, || format!("closing {address}"), session.close()).await {
        warn!("session to {address} did not close cleanly: {e}");
    }

    outcome.map(|()| replies)
}

/// Bound one transport call by `limit`.
pub async fn bounded<T>(
    limit: Duration,
    action: impl FnOnce() -> String,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            action: action(),
            millis: limit.as_millis() as u64,
        }),
    }
}

/// Host and VXI-11 device name extracted from a resource string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanTarget {
    pub host: String,
    pub device: String,
}

impl LanTarget {
    /// Accepts `TCPIP[n]::host[::device][::INSTR]` or a bare host name.
    pub fn parse(address: &str) -> anyhow::Result<Self> {
        let address = address.trim();
        if !address.contains("::") {
            if address.is_empty() {
                return Err(anyhow!("empty resource address"));
            }
            return Ok(Self {
                host: address.to_string(),
                device: DEFAULT_DEVICE.to_string(),
            });
        }

        if address.to_uppercase().ends_with("::SOCKET") {
            return Err(anyhow!("raw socket resource {address:?} is not a VXI-11 endpoint"));
        }

        let mut parts = address.split("::");
        let board = parts.next().unwrap_or_default();
        if !board.to_uppercase().starts_with("TCPIP") {
            return Err(anyhow!("unsupported resource {address:?}: only TCPIP resources are reachable"));
        }
        let host = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| anyhow!("missing host in resource {address:?}"))?;
        let device = match parts.next() {
            Some(d) if d.eq_ignore_ascii_case("INSTR") => DEFAULT_DEVICE,
            Some(d) if !d.is_empty() => d,
            _ => DEFAULT_DEVICE,
        };
        Ok(Self {
            host: host.to_string(),
            device: device.to_string(),
        })
    }
}

/// VXI-11 gateway over a fixed list of configured resources.
///
/// VXI-11 has no enumeration of its own, so the list comes from configuration.
pub struct Vxi11Transport {
    resources: Vec<ResourceAddress>,
}

impl Vxi11Transport {
    pub fn new(resources: Vec<ResourceAddress>) -> Self {
        Self { resources }
    }
}

#[async_trait]
impl Transport for Vxi11Transport {
    async fn list_resources(&self) -> Result<Vec<ResourceAddress>> {
        Ok(self.resources.clone())
    }

    async fn open(&self, address: &ResourceAddress) -> Result<Box<dyn Session>> {
        let connect = async {
            let target = LanTarget::parse(address.as_str())?;
            debug!("VXI-11 connect -> {}/{}", target.host, target.device);
            let inner = DeviceClient::connect(&target.host, &target.device)
                .await
                .with_context(|| format!("VXI-11 link to {}/{} failed", target.host, target.device))?;
            anyhow::Ok(inner)
        };
        match connect.await {
            Ok(inner) => Ok(Box::new(Vxi11Session { inner })),
            Err(e) => Err(Error::Connect {
                address: address.to_string(),
                message: format!("{e:#}"),
            }),
        }
    }
}

pub struct Vxi11Session {
    inner: DeviceClient,
}

impl Vxi11Session {
    async fn write_line(&mut self, command: &str) -> anyhow::Result<()> {
        debug!("SCPI write  -> {}", command);
        self.inner
            .write(format!("{command}\n").as_bytes())
            .await
            .with_context(|| format!("failed to send {command:?}"))?;
        Ok(())
    }

    async fn read_reply(&mut self, command: &str) -> anyhow::Result<String> {
        let resp = self.inner.read(MAX_READ).await?;
        let raw = String::from_utf8(resp)?;
        let trimmed = raw.trim_matches(char::from(0)).trim().to_string();

        debug!("SCPI result <- {}", trimmed);

        if trimmed.is_empty() {
            return Err(anyhow!("empty response from device for command {command:?}"));
        }

        Ok(trimmed)
    }
}

#[async_trait]
impl Session for Vxi11Session {
    async fn send(&mut self, command: &str) -> Result<()> {
        self.write_line(command).await.map_err(|e| Error::Write {
            command: command.to_string(),
            message: format!("{e:#}"),
        })
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        debug!("SCPI query  -> {}", command);
        let exchange = async {
            self.write_line(command).await?;
            self.read_reply(command).await
        };
        exchange.await.map_err(|e| Error::Query {
            command: command.to_string(),
            message: format!("{e:#}"),
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await.map_err(|e| Error::Write {
            command: "<close>".to_string(),
            message: format!("{:#}", anyhow::Error::from(e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_visa_lan_resources() {
        let t = LanTarget::parse("TCPIP0::192.168.0.232::inst0::INSTR").unwrap();
        assert_eq!(t.host, "192.168.0.232");
        assert_eq!(t.device, "inst0");

        let t = LanTarget::parse("TCPIP::psu-lab-2::gpib0,5::INSTR").unwrap();
        assert_eq!(t.host, "psu-lab-2");
        assert_eq!(t.device, "gpib0,5");

        let t = LanTarget::parse("TCPIP0::10.0.0.7::INSTR").unwrap();
        assert_eq!(t.device, "inst0");
    }

    #[test]
    fn bare_host_uses_default_device() {
        let t = LanTarget::parse("192.168.0.10").unwrap();
        assert_eq!(t.host, "192.168.0.10");
        assert_eq!(t.device, "inst0");
    }

    #[test]
    fn rejects_non_lan_resources() {
        assert!(LanTarget::parse("USB0::0x0957::0x8B18::MY1234::INSTR").is_err());
        assert!(LanTarget::parse("TCPIP0::10.0.0.7::5025::SOCKET").is_err());
        assert!(LanTarget::parse("TCPIP0::::INSTR").is_err());
        assert!(LanTarget::parse("  ").is_err());
    }
}
