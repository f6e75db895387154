//! Server deletion

use super::Orchestrator;
use crate::{
    Result,
    confirm::require,
    naming::{hostname_from_name, node_name},
    phase::Phase,
    provider::{InstanceState, ServerRecord},
};
use fleet_config::{ConfigError, RunParams};
use tracing::info;

const TERMINATE: Phase = Phase::new(1, "terminate");
const DEREGISTER: Phase = Phase::new(2, "deregister");

impl Orchestrator {
    /// Terminate the matching servers and forget their config-management nodes
    ///
    /// Deleting more than one server asks twice. Returns the fqdns of the
    /// servers deleted.
    pub async fn delete_servers(&self, params: &RunParams, filter: Option<&str>) -> Result<Vec<String>> {
        let subnetwork = params.require_subnetwork().map_err(ConfigError::from)?;
        let servers = self
            .locate_servers(params, filter, &[InstanceState::Running, InstanceState::Stopped])
            .await?;
        for server in &servers {
            info!("  {} ({}, {})", server.fqdn(), server.id, server.state);
        }
        require(self.confirm(), &format!("Delete {} server(s)", servers.len()))?;
        if servers.len() > 1 {
            require(
                self.confirm(),
                &format!("Really terminate {} server(s)", servers.len()),
            )?;
        }

        let runner = self.runner(params.batch_size);
        let terminated = runner
            .run(
                TERMINATE,
                servers,
                |s| s.fqdn().to_string(),
                move |server: ServerRecord| async move {
                    self.terminate(&server.id).await?;
                    Ok(server)
                },
            )
            .await?
            .completed;

        let deleted = runner
            .run(
                DEREGISTER,
                terminated,
                |s| s.fqdn().to_string(),
                move |server| async move {
                    let hostname = hostname_from_name(server.tag("Name").unwrap_or(&server.id));
                    self.config_management()
                        .deregister(&node_name(hostname, subnetwork))
                        .await?;
                    Ok(server.fqdn().to_string())
                },
            )
            .await?
            .completed;
        info!("Deleted {} server(s)", deleted.len());
        Ok(deleted)
    }
}
