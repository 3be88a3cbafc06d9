//! `datastore` removes members from the etcd datastore backing the
//! Kubernetes API.
use async_trait::async_trait;
use tracing::{info, warn};

use crate::cluster::{join_host_port, MembershipClient};
use crate::config::{DatastoreConfig, DatastoreKind};
use crate::quorum::can_remove_datastore_member;

/// A connected datastore client.
#[async_trait]
pub trait DatastoreClient: Send + Sync {
    /// Removes the datastore member called `name`.
    async fn remove_node_by_name(&self, name: &str) -> anyhow::Result<()>;

    /// Closes the connection.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Creates datastore clients. A fresh client is created for every operation.
#[async_trait]
pub trait DatastoreConnector: Send + Sync {
    /// Connects to the datastore through `endpoints`.
    async fn connect(&self, endpoints: &[String]) -> anyhow::Result<Box<dyn DatastoreClient>>;
}

/// What happened to a datastore member removal request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Removal {
    /// The member was removed.
    Removed,
    /// Nothing was attempted, for the given reason.
    Skipped(&'static str),
}

/// Builds the client URLs of all embedded datastore members except `exclude`.
pub fn client_urls<'a, I>(hosts: I, exclude: &str, port: u16) -> Vec<String>
where
    I: IntoIterator<Item = (&'a str, String)>,
{
    hosts
        .into_iter()
        .filter(|(name, _)| *name != exclude)
        .map(|(_, host)| format!("https://{}", join_host_port(&host, port)))
        .collect()
}

/// Connects through `endpoints` and removes the member called `name`.
///
/// The client is closed whether or not the removal succeeded.
pub async fn remove_member(
    connector: &dyn DatastoreConnector,
    endpoints: &[String],
    name: &str,
) -> anyhow::Result<()> {
    let client = connector
        .connect(endpoints)
        .await
        .map_err(|e| anyhow::anyhow!("failed to create datastore client: {:#}", e))?;
    info!(node = %name, endpoints = ?endpoints, "Deleting node from datastore cluster");
    let result = client
        .remove_node_by_name(name)
        .await
        .map_err(|e| anyhow::anyhow!("failed to remove node {} from datastore cluster: {:#}", name, e));
    if let Err(e) = client.close().await {
        warn!(error = %e, "Failed to close datastore client");
    }
    result
}

/// Removes the node called `name` from the cluster's datastore.
///
/// For the embedded datastore the endpoints are derived from the consensus
/// store roster, leaving out the node being removed so the request is not
/// sent to it. External datastores are left to their administrator.
pub async fn remove_node_from_datastore(
    membership: &dyn MembershipClient,
    connector: &dyn DatastoreConnector,
    config: &DatastoreConfig,
    name: &str,
) -> anyhow::Result<Removal> {
    match config.kind {
        DatastoreKind::External => {
            info!(node = %name, "External datastore membership is managed by the administrator");
            Ok(Removal::Skipped("external datastore"))
        }
        DatastoreKind::Embedded => {
            let members = membership
                .cluster_members()
                .await
                .map_err(|e| anyhow::anyhow!("failed to get cluster members: {:#}", e))?;

            if !can_remove_datastore_member(members.len(), config.kind) {
                warn!(
                    node = %name,
                    members = members.len(),
                    "Not removing datastore member, the datastore would lose quorum"
                );
                return Ok(Removal::Skipped("quorum protection"));
            }

            let endpoints = client_urls(
                members.iter().map(|m| (m.name.as_str(), m.host())),
                name,
                config.port(),
            );
            remove_member(connector, &endpoints, name).await?;
            Ok(Removal::Removed)
        }
    }
}
