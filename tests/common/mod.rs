#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bench_supply::{BenchConfig, Error, ResourceAddress, Result, Session, Transport};

pub const AGILENT_DUAL: &str = "Agilent Technologies,2342-06 B,MY12345678,A.01.02";
pub const SINGLE: &str = "Keysight Technologies,E36103B,MY99999999,1.0.2";

/// Scripted in-memory transport that records every exchange.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    resources: Vec<ResourceAddress>,
    list_error: Option<Error>,
    identities: HashMap<ResourceAddress, String>,
    unreachable: HashSet<ResourceAddress>,
    replies: HashMap<String, String>,
    failures: HashMap<String, Error>,
    delays: HashMap<String, Duration>,
    commands: Vec<String>,
    opens: usize,
    closes: usize,
    open_now: usize,
    max_open: usize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn instrument(self, address: &str, identification: &str) -> Self {
        self.with(|s| {
            let address = ResourceAddress::new(address);
            s.resources.push(address.clone());
            s.identities.insert(address, identification.to_string());
        });
        self
    }

    /// Listed but never answers.
    pub fn dead(self, address: &str) -> Self {
        self.with(|s| {
            let address = ResourceAddress::new(address);
            s.resources.push(address.clone());
            s.unreachable.insert(address);
        });
        self
    }

    pub fn failing_enumeration(self) -> Self {
        self.with(|s| s.list_error = Some(Error::Discovery("no VISA backend".to_string())));
        self
    }

    pub fn reply(self, command: &str, reply: &str) -> Self {
        self.with(|s| s.replies.insert(command.to_string(), reply.to_string()));
        self
    }

    pub fn fail(&self, command: &str) {
        self.with(|s| {
            s.failures.insert(
                command.to_string(),
                Error::Write {
                    command: command.to_string(),
                    message: "instrument rejected command".to_string(),
                },
            )
        });
    }

    pub fn heal(&self, command: &str) {
        self.with(|s| s.failures.remove(command));
    }

    pub fn delay(&self, command: &str, by: Duration) {
        self.with(|s| s.delays.insert(command.to_string(), by));
    }

    pub fn commands(&self) -> Vec<String> {
        self.with(|s| s.commands.clone())
    }

    pub fn clear_commands(&self) {
        self.with(|s| s.commands.clear());
    }

    pub fn opens(&self) -> usize {
        self.with(|s| s.opens)
    }

    pub fn closes(&self) -> usize {
        self.with(|s| s.closes)
    }

    pub fn max_open(&self) -> usize {
        self.with(|s| s.max_open)
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn list_resources(&self) -> Result<Vec<ResourceAddress>> {
        self.with(|s| match &s.list_error {
            Some(e) => Err(e.clone()),
            None => Ok(s.resources.clone()),
        })
    }

    async fn open(&self, address: &ResourceAddress) -> Result<Box<dyn Session>> {
        self.with(|s| {
            if s.unreachable.contains(address) {
                return Err(Error::Connect {
                    address: address.to_string(),
                    message: "no route to host".to_string(),
                });
            }
            s.opens += 1;
            s.open_now += 1;
            s.max_open = s.max_open.max(s.open_now);
            Ok(())
        })?;
        Ok(Box::new(MockSession {
            state: Arc::clone(&self.state),
            address: address.clone(),
            open: true,
        }))
    }
}

struct MockSession {
    state: Arc<Mutex<MockState>>,
    address: ResourceAddress,
    open: bool,
}

impl MockSession {
    async fn exchange(&mut self, command: &str) -> Result<()> {
        let delay = {
            let mut s = self.state.lock().unwrap();
            s.commands.push(command.to_string());
            s.delays.get(command).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.state.lock().unwrap().failures.get(command) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Session for MockSession {
    async fn send(&mut self, command: &str) -> Result<()> {
        self.exchange(command).await
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.exchange(command).await?;
        let s = self.state.lock().unwrap();
        if command == "*IDN?" {
            return Ok(s.identities.get(&self.address).cloned().unwrap_or_default());
        }
        Ok(s.replies.get(command).cloned().unwrap_or_else(|| "0".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            let mut s = self.state.lock().unwrap();
            s.closes += 1;
            s.open_now -= 1;
        }
        Ok(())
    }
}

pub fn config() -> BenchConfig {
    BenchConfig {
        timeout_ms: 200,
        identify_timeout_ms: 200,
        ..BenchConfig::default()
    }
}

/// Collects formatted log records emitted on the current thread.
#[derive(Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let buf = Arc::clone(&self.buf);
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || CaptureWriter(Arc::clone(&buf)))
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).into_owned()
    }
}

struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for CaptureWriter {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
