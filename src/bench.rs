//! Per-channel session state machine.
//!
//! [`Bench`] owns the discovered channels and their connection, protection
//! and power state. Every operation takes the target descriptor explicitly,
//! opens its own short-lived session, and commits state only on success.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::BenchConfig;
use crate::discovery::{ChannelDescriptor, ChannelKey, Discovery};
use crate::display::DisplayNames;
use crate::error::{Error, Result};
use crate::protocol::{self, MeasureKind, ProtectionKind};
use crate::transport::{Exchange, Transport, run_scoped};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PowerStatus {
    On,
    #[default]
    Off,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtectionState {
    pub over_voltage_armed: bool,
    pub over_current_armed: bool,
}

impl ProtectionState {
    pub fn is_armed(&self) -> bool {
        self.over_voltage_armed && self.over_current_armed
    }

    fn arm(&mut self, kind: ProtectionKind) {
        match kind {
            ProtectionKind::OverVoltage => self.over_voltage_armed = true,
            ProtectionKind::OverCurrent => self.over_current_armed = true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelState {
    pub connection: ConnectionStatus,
    pub protection: ProtectionState,
    pub power: PowerStatus,
}

impl ChannelState {
    pub fn voltage_control_enabled(&self) -> bool {
        self.connection == ConnectionStatus::Connected && self.protection.is_armed()
    }
}

/// Result of arming one protection limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Armed {
    /// Set only by the call that completed the interlock.
    pub voltage_control_enabled: bool,
}

/// Raw replies to the voltage, current and power queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measurement {
    pub voltage: String,
    pub current: String,
    pub power: String,
}

struct ChannelEntry {
    state: ChannelState,
    lock: Arc<AsyncMutex<()>>,
}

#[derive(Default)]
struct Registry {
    descriptors: Vec<ChannelDescriptor>,
    channels: HashMap<ChannelKey, ChannelEntry>,
}

pub struct Bench {
    transport: Arc<dyn Transport>,
    discovery: Discovery,
    names: DisplayNames,
    timeout: Duration,
    registry: Mutex<Registry>,
}

impl Bench {
    pub fn new(transport: Arc<dyn Transport>, config: &BenchConfig) -> Self {
        Self {
            transport,
            discovery: Discovery::new(config.dual_channel_models.clone(), config.identify_timeout()),
            names: config.display_names(),
            timeout: config.timeout(),
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Replace the channel list with a fresh discovery pass and seed each
    /// channel's power status.
    pub async fn discover(&self) -> Result<Vec<ChannelDescriptor>> {
        let found = self
            .discovery
            .discover(self.transport.as_ref())
            .await
            .inspect_err(|e| warn!("{e}"))?;
        if found.is_empty() {
            info!("no identifiable devices found");
        }

        let held = self.quiesce().await;
        {
            let mut registry = self.registry();
            registry.channels = found
                .iter()
                .map(|d| {
                    let key = d.key();
                    let lock = held
                        .get(&key)
                        .map(|(lock, _)| Arc::clone(lock))
                        .unwrap_or_else(|| Arc::new(AsyncMutex::new(())));
                    let entry = ChannelEntry {
                        state: ChannelState::default(),
                        lock,
                    };
                    (key, entry)
                })
                .collect();
            registry.descriptors = found.clone();
        }
        drop(held);

        for descriptor in &found {
            if self.refresh_power(descriptor).await.is_err() {
                debug!("{}: output status left at Off", self.label(descriptor));
            }
        }
        Ok(found)
    }

    pub fn channels(&self) -> Vec<ChannelDescriptor> {
        self.registry().descriptors.clone()
    }

    pub fn state(&self, descriptor: &ChannelDescriptor) -> Option<ChannelState> {
        self.registry()
            .channels
            .get(&descriptor.key())
            .map(|entry| entry.state)
    }

    /// Human-readable channel tag used in log records.
    pub fn label(&self, descriptor: &ChannelDescriptor) -> String {
        let name = self.names.label_for(&descriptor.identification);
        match descriptor.channel {
            Some(ch) => format!("{name} Channel {ch}"),
            None => name.to_string(),
        }
    }

    /// Lock the instrument's front panel for this channel.
    pub async fn connect(&self, descriptor: &ChannelDescriptor) -> Result<()> {
        let _guard = self.acquire(descriptor).await?;
        let command = protocol::format_lock_command(descriptor.channel, true);
        self.exchange(descriptor, &[Exchange::Send(command)])
            .await
            .inspect_err(|e| self.failed(descriptor, "Error connecting", e))?;
        self.update(descriptor, |state| state.connection = ConnectionStatus::Connected);
        info!("{}: connected", self.label(descriptor));
        Ok(())
    }

    pub async fn disconnect(&self, descriptor: &ChannelDescriptor) -> Result<()> {
        let _guard = self.acquire(descriptor).await?;
        let command = protocol::format_lock_command(descriptor.channel, false);
        self.exchange(descriptor, &[Exchange::Send(command)])
            .await
            .inspect_err(|e| self.failed(descriptor, "Error disconnecting", e))?;
        self.update(descriptor, |state| state.connection = ConnectionStatus::Disconnected);
        info!("{}: disconnected", self.label(descriptor));
        Ok(())
    }

    pub async fn arm_over_voltage(&self, descriptor: &ChannelDescriptor, limit: &str) -> Result<Armed> {
        self.arm(descriptor, ProtectionKind::OverVoltage, limit).await
    }

    pub async fn arm_over_current(&self, descriptor: &ChannelDescriptor, limit: &str) -> Result<Armed> {
        self.arm(descriptor, ProtectionKind::OverCurrent, limit).await
    }

    async fn arm(&self, descriptor: &ChannelDescriptor, kind: ProtectionKind, limit: &str) -> Result<Armed> {
        let limit = protocol::parse_level(kind.label(), limit)
            .inspect_err(|e| self.failed(descriptor, "Rejected input", e))?;
        let _guard = self.acquire(descriptor).await?;
        self.require_connected(descriptor)?;

        let command = protocol::format_protection_command(kind, descriptor.channel, limit);
        self.exchange(descriptor, &[Exchange::Send(command)])
            .await
            .inspect_err(|e| self.failed(descriptor, &format!("Failed to set {}", kind.label()), e))?;

        let mut newly_enabled = false;
        self.update(descriptor, |state| {
            let before = state.protection.is_armed();
            state.protection.arm(kind);
            newly_enabled = !before && state.protection.is_armed();
        });
        let label = self.label(descriptor);
        info!("{label}: {} set to {limit}", kind.label());
        if newly_enabled {
            info!("{label}: protection limits set, voltage control enabled");
        }
        Ok(Armed {
            voltage_control_enabled: newly_enabled,
        })
    }

    /// Program the output voltage; requires both protection limits armed.
    pub async fn set_voltage(&self, descriptor: &ChannelDescriptor, volts: &str) -> Result<()> {
        let volts = protocol::parse_level("voltage", volts)
            .inspect_err(|e| self.failed(descriptor, "Rejected input", e))?;
        let _guard = self.acquire(descriptor).await?;
        let state = self.current(descriptor)?;
        if !state.protection.is_armed() {
            let e = Error::Interlock(
                "voltage control requires both over-voltage and over-current limits".to_string(),
            );
            self.failed(descriptor, "Refused", &e);
            return Err(e);
        }
        self.require_connected(descriptor)?;

        let command = protocol::format_voltage_command(descriptor.channel, volts);
        self.exchange(descriptor, &[Exchange::Send(command)])
            .await
            .inspect_err(|e| self.failed(descriptor, "Error setting voltage", e))?;
        info!("{}: voltage set to {volts} V", self.label(descriptor));
        Ok(())
    }

    pub async fn power_on(&self, descriptor: &ChannelDescriptor) -> Result<()> {
        self.set_output(descriptor, true).await
    }

    pub async fn power_off(&self, descriptor: &ChannelDescriptor) -> Result<()> {
        self.set_output(descriptor, false).await
    }

    async fn set_output(&self, descriptor: &ChannelDescriptor, enable: bool) -> Result<()> {
        let _guard = self.acquire(descriptor).await?;
        self.require_connected(descriptor)?;
        let command = protocol::format_output_command(descriptor.channel, enable);
        let action = if enable { "Error powering on" } else { "Error powering off" };
        self.exchange(descriptor, &[Exchange::Send(command)])
            .await
            .inspect_err(|e| self.failed(descriptor, action, e))?;

        let power = if enable { PowerStatus::On } else { PowerStatus::Off };
        self.update(descriptor, |state| state.power = power);
        info!("{}: power {}", self.label(descriptor), if enable { "ON" } else { "OFF" });
        Ok(())
    }

    /// Query the output-enable state and record it.
    pub async fn refresh_power(&self, descriptor: &ChannelDescriptor) -> Result<PowerStatus> {
        let _guard = self.acquire(descriptor).await?;
        let query = protocol::format_output_query(descriptor.channel);
        let replies = self
            .exchange(descriptor, &[Exchange::Query(query)])
            .await
            .inspect_err(|e| self.failed(descriptor, "Error reading output status", e))?;
        let on = replies.first().is_some_and(|reply| protocol::parse_power_state(reply));
        let power = if on { PowerStatus::On } else { PowerStatus::Off };
        self.update(descriptor, |state| state.power = power);
        Ok(power)
    }

    /// Read voltage, current and power; all three or nothing.
    pub async fn measure(&self, descriptor: &ChannelDescriptor) -> Result<Measurement> {
        let _guard = self.acquire(descriptor).await?;
        self.require_connected(descriptor)?;
        let steps: Vec<Exchange> = MeasureKind::SEQUENCE
            .into_iter()
            .map(|kind| Exchange::Query(protocol::format_measure_query(kind, descriptor.channel)))
            .collect();
        let replies = self
            .exchange(descriptor, &steps)
            .await
            .inspect_err(|e| self.failed(descriptor, "Error measuring values", e))?;

        let mut replies = replies.into_iter();
        let mut next = || replies.next().unwrap_or_default();
        let measurement = Measurement {
            voltage: next(),
            current: next(),
            power: next(),
        };
        info!(
            "{}: measured V={} I={} P={}",
            self.label(descriptor),
            measurement.voltage,
            measurement.current,
            measurement.power
        );
        Ok(measurement)
    }

    /// Connect, measure and disconnect again.
    ///
    /// A successful reading is returned even when the final unlock fails; that
    /// failure is only logged.
    pub async fn measure_once(&self, descriptor: &ChannelDescriptor) -> Result<Measurement> {
        self.connect(descriptor).await?;
        let outcome = self.measure(descriptor).await;
        if self.disconnect(descriptor).await.is_err() {
            debug!("{}: left locked after measurement", self.label(descriptor));
        }
        outcome
    }

    /// Best-effort unlock of every channel, then forget all of them.
    pub async fn clear_all(&self) {
        let held = self.quiesce().await;
        let descriptors = self.channels();
        for descriptor in &descriptors {
            let command = protocol::format_lock_command(descriptor.channel, false);
            if let Err(e) = self.exchange(descriptor, &[Exchange::Send(command)]).await {
                warn!("{}: unlock during clear failed ({e})", self.label(descriptor));
            }
        }
        *self.registry() = Registry::default();
        drop(held);
        info!("cleared {} channel(s)", descriptors.len());
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the channel's operation lock. Fails if the channel is unknown,
    /// or was dropped by `clear_all` or rediscovery while waiting.
    async fn acquire(&self, descriptor: &ChannelDescriptor) -> Result<OwnedMutexGuard<()>> {
        let key = descriptor.key();
        let lock = self.channel_lock(&key);
        let guard = match lock {
            Some(lock) => {
                let guard = Arc::clone(&lock).lock_owned().await;
                self.channel_lock(&key)
                    .filter(|current| Arc::ptr_eq(current, &lock))
                    .map(|_| guard)
            }
            None => None,
        };
        guard
            .ok_or_else(|| Error::UnknownChannel(key.to_string()))
            .inspect_err(|e| self.failed(descriptor, "Refused", e))
    }

    fn channel_lock(&self, key: &ChannelKey) -> Option<Arc<AsyncMutex<()>>> {
        self.registry()
            .channels
            .get(key)
            .map(|entry| Arc::clone(&entry.lock))
    }

    /// Wait for every in-flight channel operation and hold all channel locks.
    async fn quiesce(&self) -> HashMap<ChannelKey, (Arc<AsyncMutex<()>>, OwnedMutexGuard<()>)> {
        let mut locks: Vec<(ChannelKey, Arc<AsyncMutex<()>>)> = self
            .registry()
            .channels
            .iter()
            .map(|(key, entry)| (key.clone(), Arc::clone(&entry.lock)))
            .collect();
        locks.sort_by(|a, b| a.0.cmp(&b.0));

        let mut held = HashMap::with_capacity(locks.len());
        for (key, lock) in locks {
            let guard = Arc::clone(&lock).lock_owned().await;
            held.insert(key, (lock, guard));
        }
        held
    }

    fn current(&self, descriptor: &ChannelDescriptor) -> Result<ChannelState> {
        self.state(descriptor)
            .ok_or_else(|| Error::UnknownChannel(descriptor.key().to_string()))
    }

    fn require_connected(&self, descriptor: &ChannelDescriptor) -> Result<()> {
        if self.current(descriptor)?.connection == ConnectionStatus::Connected {
            return Ok(());
        }
        let e = Error::Interlock("channel is not connected".to_string());
        self.failed(descriptor, "Refused", &e);
        Err(e)
    }

    fn update(&self, descriptor: &ChannelDescriptor, change: impl FnOnce(&mut ChannelState)) {
        if let Some(entry) = self.registry().channels.get_mut(&descriptor.key()) {
            change(&mut entry.state);
        }
    }

    async fn exchange(&self, descriptor: &ChannelDescriptor, steps: &[Exchange]) -> Result<Vec<String>> {
        run_scoped(self.transport.as_ref(), &descriptor.address, steps, self.timeout).await
    }

    fn failed(&self, descriptor: &ChannelDescriptor, action: &str, error: &Error) {
        warn!("{}: {action}: {error}", self.label(descriptor));
    }
}
