//! Instrument discovery and logical channel classification.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{self, ChannelId};
use crate::transport::{Exchange, ResourceAddress, Transport, bounded, run_scoped};

/// Identifies one logical channel: an address plus, for dual-output units,
/// the output number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    pub address: ResourceAddress,
    pub channel: Option<ChannelId>,
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel {
            Some(ch) => write!(f, "{} (@{ch})", self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// A logical channel produced by one discovery pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub address: ResourceAddress,
    pub identification: String,
    /// Unset for single-output instruments.
    pub channel: Option<ChannelId>,
    /// 1-based index of the physical instrument, shared by its channels.
    pub ordinal: u32,
}

impl ChannelDescriptor {
    pub fn key(&self) -> ChannelKey {
        ChannelKey {
            address: self.address.clone(),
            channel: self.channel,
        }
    }
}

pub struct Discovery {
    dual_channel_models: Vec<String>,
    identify_timeout: Duration,
}

impl Discovery {
    pub fn new(dual_channel_models: Vec<String>, identify_timeout: Duration) -> Self {
        Self {
            dual_channel_models,
            identify_timeout,
        }
    }

    pub fn is_dual_channel(&self, identification: &str) -> bool {
        self.dual_channel_models
            .iter()
            .any(|model| !model.is_empty() && identification.contains(model.as_str()))
    }

    /// Descriptors for one identified physical instrument.
    pub fn classify(
        &self,
        address: &ResourceAddress,
        identification: &str,
        ordinal: u32,
    ) -> Vec<ChannelDescriptor> {
        let descriptor = |channel| ChannelDescriptor {
            address: address.clone(),
            identification: identification.to_string(),
            channel,
            ordinal,
        };
        if self.is_dual_channel(identification) {
            ChannelId::ALL.into_iter().map(|ch| descriptor(Some(ch))).collect()
        } else {
            vec![descriptor(None)]
        }
    }

    /// Enumerate and identify every reachable instrument.
    ///
    /// Instruments that do not answer the identity query are left out. Only a
    /// failure to enumerate at all is an error; an empty result is not.
    pub async fn discover(&self, transport: &dyn Transport) -> Result<Vec<ChannelDescriptor>> {
        let addresses = bounded(
            self.identify_timeout,
            || "listing resources".to_string(),
            transport.list_resources(),
        )
        .await
        .map_err(|e| Error::Discovery(e.to_string()))?;
        debug!("enumerated {} resource(s)", addresses.len());

        let mut seen = HashSet::new();
        let mut descriptors = Vec::new();
        let mut ordinal = 0;
        for address in addresses {
            if !seen.insert(address.clone()) {
                debug!("skipping repeated resource {address}");
                continue;
            }
            match self.identify(transport, &address).await {
                Ok(identification) => {
                    ordinal += 1;
                    let found = self.classify(&address, &identification, ordinal);
                    info!(
                        "found #{ordinal} {identification} at {address} ({} channel{})",
                        found.len(),
                        if found.len() == 1 { "" } else { "s" }
                    );
                    descriptors.extend(found);
                }
                Err(e) => warn!("{address}: unable to identify ({e})"),
            }
        }
        Ok(descriptors)
    }

    async fn identify(&self, transport: &dyn Transport, address: &ResourceAddress) -> Result<String> {
        let steps = [Exchange::Query(protocol::format_identity_query())];
        let replies = run_scoped(transport, address, &steps, self.identify_timeout).await?;
        let identification = replies
            .into_iter()
            .next()
            .map(|reply| reply.trim_matches(char::from(0)).trim().to_string())
            .unwrap_or_default();
        if identification.is_empty() {
            return Err(Error::Query {
                command: protocol::format_identity_query(),
                message: "empty identification".to_string(),
            });
        }
        Ok(identification)
    }
}
