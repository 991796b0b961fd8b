//! SCPI command formatting and reply parsing.
//!
//! Every function here is pure: it builds the text handed to a
//! [`Session`](crate::transport::Session) or interprets the text coming back.
//! Commands carry no line terminator; the transport appends it.

use std::fmt;

use crate::error::{Error, Result};

/// One logical output of a dual-output instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelId {
    One,
    Two,
}

impl ChannelId {
    pub const ALL: [ChannelId; 2] = [ChannelId::One, ChannelId::Two];

    fn as_scpi(self) -> &'static str {
        match self {
            ChannelId::One => "1",
            ChannelId::Two => "2",
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_scpi())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionKind {
    OverVoltage,
    OverCurrent,
}

impl ProtectionKind {
    fn as_scpi(self) -> &'static str {
        match self {
            ProtectionKind::OverVoltage => "VOLT:PROT",
            ProtectionKind::OverCurrent => "CURR:PROT",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ProtectionKind::OverVoltage => "over-voltage limit",
            ProtectionKind::OverCurrent => "over-current limit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureKind {
    Voltage,
    Current,
    Power,
}

impl MeasureKind {
    /// Order in which a full measurement queries the instrument.
    pub const SEQUENCE: [MeasureKind; 3] =
        [MeasureKind::Voltage, MeasureKind::Current, MeasureKind::Power];

    fn as_scpi(self) -> &'static str {
        match self {
            MeasureKind::Voltage => "MEAS:VOLT?",
            MeasureKind::Current => "MEAS:CURR?",
            MeasureKind::Power => "MEAS:POW?",
        }
    }
}

pub fn format_identity_query() -> String {
    "*IDN?".to_string()
}

pub fn format_lock_command(channel: Option<ChannelId>, enable: bool) -> String {
    addressed(&format!("SYST:LOCK {}", on_off(enable)), channel)
}

pub fn format_output_command(channel: Option<ChannelId>, enable: bool) -> String {
    addressed(&format!("OUTP {}", on_off(enable)), channel)
}

pub fn format_output_query(channel: Option<ChannelId>) -> String {
    addressed("OUTP?", channel)
}

pub fn format_voltage_command(channel: Option<ChannelId>, volts: f64) -> String {
    addressed(&format!("VOLT {volts}"), channel)
}

pub fn format_protection_command(
    kind: ProtectionKind,
    channel: Option<ChannelId>,
    limit: f64,
) -> String {
    addressed(&format!("{} {limit}", kind.as_scpi()), channel)
}

pub fn format_measure_query(kind: MeasureKind, channel: Option<ChannelId>) -> String {
    addressed(kind.as_scpi(), channel)
}

/// `true` iff the reply is `1` or `ON` (any case) once trimmed.
pub fn parse_power_state(reply: &str) -> bool {
    let reply = reply.trim_matches(char::from(0)).trim();
    reply == "1" || reply.eq_ignore_ascii_case("ON")
}

/// Parse operator-entered set-point text into a finite number.
pub fn parse_level(field: &'static str, input: &str) -> Result<f64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation {
            field,
            reason: "no value entered".to_string(),
        });
    }
    let value = trimmed.parse::<f64>().map_err(|e| Error::Validation {
        field,
        reason: format!("{trimmed:?} is not a number ({e})"),
    })?;
    if !value.is_finite() {
        return Err(Error::Validation {
            field,
            reason: format!("{trimmed:?} is not a finite number"),
        });
    }
    Ok(value)
}

fn on_off(enable: bool) -> &'static str {
    if enable { "ON" } else { "OFF" }
}

fn addressed(command: &str, channel: Option<ChannelId>) -> String {
    match channel {
        Some(ch) => format!("{command} (@{})", ch.as_scpi()),
        None => command.to_string(),
    }
}
