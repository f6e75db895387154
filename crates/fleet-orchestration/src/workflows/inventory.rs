//! Server listing and details

use super::Orchestrator;
use crate::{
    Error, Result,
    provider::{InstanceState, ServerRecord, TagQuery, VolumeRecord},
    tags,
};
use fleet_config::RunParams;
use serde::Serialize;
use tracing::{debug, info};

/// A server with the volumes attached to it
#[derive(Debug, Clone, Serialize)]
pub struct ServerDetails {
    /// The server
    pub server: ServerRecord,
    /// Its attached volumes, in block-device order
    pub volumes: Vec<VolumeRecord>,
}

impl Orchestrator {
    /// Running and stopped servers of each `(network, subnetwork)`, sorted by fqdn
    ///
    /// `filter` is a hostname prefix. Finding none is an error.
    pub async fn list_servers(&self, subnetworks: &[(String, String)], filter: Option<&str>) -> Result<Vec<ServerRecord>> {
        let client = self.client();
        let mut servers = Vec::new();
        for (network, subnetwork) in subnetworks {
            let pattern = tags::server_pattern(network, subnetwork, filter.unwrap_or_default());
            let query = TagQuery::value(&pattern).in_states(&[InstanceState::Running, InstanceState::Stopped]);
            let query = &query;
            let found = client
                .call("describe-instances", move || client.provider().describe_servers(query))
                .await?;
            debug!("{} server(s) tagged {}", found.len(), pattern);
            servers.extend(found);
        }
        if servers.is_empty() {
            let scopes: Vec<String> = subnetworks.iter().map(|(n, s)| format!("{}.{}", n, s)).collect();
            return Err(Error::NotFound(format!("servers in {}", scopes.join(", "))));
        }
        servers.sort_by(|a, b| a.fqdn().cmp(b.fqdn()));
        info!("Listed {} server(s)", servers.len());
        Ok(servers)
    }

    /// One server by hostname, with its volumes
    pub async fn show_server(&self, params: &RunParams, hostname: &str) -> Result<ServerDetails> {
        let fqdn = params.fqdn(hostname);
        let query = TagQuery::key_value("fqdn", &fqdn).in_states(&[
            InstanceState::Pending,
            InstanceState::Running,
            InstanceState::Stopping,
            InstanceState::Stopped,
        ]);
        let query = &query;
        let client = self.client();
        let server = client
            .call("describe-instances", move || client.provider().describe_servers(query))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("server {}", fqdn)))?;

        let mut volumes = Vec::new();
        for mapping in &server.block_devices {
            let volume_id = mapping.volume_id.as_str();
            if let Some(volume) = client
                .call("describe-volumes", move || client.provider().get_volume(volume_id))
                .await?
            {
                volumes.push(volume);
            }
        }
        Ok(ServerDetails { server, volumes })
    }
}
