//! The standard compensations registered while a node joins the cluster.
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use super::{CompensatingAction, CompensationKind, Reverter};
use crate::config::DatastoreKind;
use crate::datastore::{remove_member, DatastoreConnector};
use crate::fsutil::remove_dir_all_if_exists;
use crate::node::NodeApi;
use crate::quorum::can_remove_datastore_member;

/// Removes the local consensus store directory if the join fails, so that a
/// retried join starts from a clean directory.
pub fn register_dqlite_state_reverter(reverter: &mut Reverter, state_dir: PathBuf) {
    let target = state_dir.display().to_string();
    reverter.add(CompensatingAction::new(
        CompensationKind::DqliteState,
        target,
        move || async move {
            match remove_dir_all_if_exists(&state_dir) {
                Ok(true) => info!(dir = %state_dir.display(), "Removed dqlite state directory"),
                Ok(false) => {}
                Err(e) => {
                    return Err(anyhow::anyhow!(
                        "failed to remove dqlite state directory {}: {}",
                        state_dir.display(),
                        e
                    ))
                }
            }
            Ok(())
        },
    ));
}

/// Removes the joining node from the embedded datastore if the join fails.
///
/// `endpoints` are the client URLs the node was joining through. With fewer
/// than three of them the removal could cost the datastore its quorum and
/// nothing is done. When the member is removed the local datastore data in
/// `data_dir` is deleted too. If the datastore cannot be reached, or refuses
/// the removal, its state is unknown and the local data is kept.
pub fn register_datastore_member_reverter(
    reverter: &mut Reverter,
    connector: Arc<dyn DatastoreConnector>,
    node_name: &str,
    endpoints: Vec<String>,
    data_dir: PathBuf,
) {
    let node_name = node_name.to_string();
    reverter.add(CompensatingAction::new(
        CompensationKind::DatastoreMember,
        node_name.clone(),
        move || async move {
            if !can_remove_datastore_member(endpoints.len(), DatastoreKind::Embedded) {
                warn!(
                    node = %node_name,
                    endpoints = endpoints.len(),
                    "Skipping datastore member cleanup, not enough members to keep quorum"
                );
                return Ok(());
            }

            if let Err(e) = remove_member(connector.as_ref(), &endpoints, &node_name).await {
                error!(
                    node = %node_name,
                    error = %format!("{:#}", e),
                    "Failed to remove datastore member, keeping local datastore state"
                );
                return Ok(());
            }

            remove_dir_all_if_exists(&data_dir).map_err(|e| {
                anyhow::anyhow!(
                    "failed to remove datastore directory {}: {}",
                    data_dir.display(),
                    e
                )
            })?;
            Ok(())
        },
    ));
}

/// Deletes the Kubernetes `Node` created for the joining node if the join
/// fails. A node that is already gone counts as deleted.
pub fn register_kubernetes_node_reverter(
    reverter: &mut Reverter,
    nodes: Arc<dyn NodeApi>,
    node_name: &str,
) {
    let node_name = node_name.to_string();
    reverter.add(CompensatingAction::new(
        CompensationKind::KubernetesNode,
        node_name.clone(),
        move || async move {
            nodes
                .delete_node(&node_name)
                .await
                .map_err(|e| anyhow::anyhow!("failed to delete node {}: {:#}", node_name, e))
        },
    ));
}
