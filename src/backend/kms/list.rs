//! Connector listing, similar to `xrandr` without arguments.

use std::fmt;

use tracing::warn;

use super::device::KmsDevice;
use super::error::KmsError;
use super::helpers::{format_connector_name, format_mode};

/// A connector and the modes it supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorSummary {
    pub name: String,
    pub connected: bool,
    /// Formatted modes, best first.
    pub modes: Vec<String>,
}

impl fmt::Display for ConnectorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.connected {
            "connected"
        } else {
            "disconnected"
        };
        writeln!(f, "{} {state}", self.name)?;

        for mode in &self.modes {
            writeln!(f, "  {mode}")?;
        }

        Ok(())
    }
}

/// Describe every connector of the device without claiming anything.
pub fn list_connectors<D: KmsDevice>(device: &D) -> Result<Vec<ConnectorSummary>, KmsError> {
    let res = device.resources().map_err(KmsError::DeviceUnavailable)?;

    let mut summaries = Vec::with_capacity(res.connectors.len());
    for &connector in &res.connectors {
        let info = match device.connector(connector) {
            Ok(info) => info,
            Err(err) => {
                warn!("error getting connector {connector}: {err:?}");
                continue;
            }
        };

        summaries.push(ConnectorSummary {
            name: format_connector_name(info.interface, info.interface_id),
            connected: info.connected,
            modes: info.modes.iter().map(format_mode).collect(),
        });
    }

    Ok(summaries)
}
