// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The mesh configuration document (spec §6): a small JSON file naming,
//! per service, the Gateways that form its mesh. Parsed with `serde` /
//! `serde_json` rather than scaproust's hand-rolled wire parsing, which
//! only ever targeted the binary frame format, not a JSON config file.

use std::path::Path;

use serde::Deserialize;

use crate::error::{GatewayError, Result};

/// Top-level shape of the startup document.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct MeshConfig {
    /// An optional discovery coordinator (spec §1: explicitly out of
    /// scope). Parsed so the shape round-trips, logged once at load time,
    /// and then never consulted again.
    #[serde(default)]
    pub coordinator_gateway: Option<String>,
    #[serde(default)]
    pub startup_meshes: Vec<StartupMesh>,
}

/// One service's mesh membership list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartupMesh {
    pub name: String,
    #[serde(default)]
    pub discover_mesh_using_coordinator: bool,
    #[serde(default)]
    pub mesh_gateways: Vec<String>,
}

impl MeshConfig {
    pub fn load(path: &Path) -> Result<MeshConfig> {
        let text = std::fs::read_to_string(path).map_err(GatewayError::TransportFailure)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<MeshConfig> {
        let config: MeshConfig = serde_json::from_str(text)
            .map_err(|err| GatewayError::ProtocolViolation(format!("invalid mesh config: {err}")))?;

        if config.coordinator_gateway.is_some() {
            log::info!("CoordinatorGateway is configured but coordinator discovery is out of scope; ignoring");
        }
        for mesh in &config.startup_meshes {
            if mesh.discover_mesh_using_coordinator {
                log::info!(
                    "service '{}': DiscoverMeshUsingCoordinator is set but not implemented; \
                     only the static MeshGateways list is honored",
                    mesh.name
                );
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reference_shape() {
        let json = r#"
        {
          "CoordinatorGateway": "coord.example.com:9000",
          "StartupMeshes": [
            {
              "Name": "orders",
              "DiscoverMeshUsingCoordinator": false,
              "MeshGateways": ["127.0.0.1:5050", "peer.example.com:5050"]
            }
          ]
        }
        "#;
        let config = MeshConfig::parse(json).unwrap();
        assert_eq!(config.coordinator_gateway.as_deref(), Some("coord.example.com:9000"));
        assert_eq!(config.startup_meshes.len(), 1);
        assert_eq!(config.startup_meshes[0].name, "orders");
        assert_eq!(config.startup_meshes[0].mesh_gateways.len(), 2);
    }

    #[test]
    fn missing_optional_fields_default() {
        let json = r#"{ "StartupMeshes": [] }"#;
        let config = MeshConfig::parse(json).unwrap();
        assert!(config.coordinator_gateway.is_none());
        assert!(config.startup_meshes.is_empty());
    }

    #[test]
    fn malformed_json_is_protocol_violation() {
        let err = MeshConfig::parse("{ not json").unwrap_err();
        assert!(matches!(err, GatewayError::ProtocolViolation(_)));
    }
}
