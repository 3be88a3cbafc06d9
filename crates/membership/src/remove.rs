//! `remove` takes a node out of the cluster.
//!
//! A node is known to three systems: Kubernetes, the datastore and the
//! consensus store roster. [`NodeRemover::remove_node`] removes it from each
//! of them in that order. Without `force` the first failure stops the
//! removal. With `force` every step is attempted and failures are only
//! logged, which is how nodes that are already partly gone get cleaned up.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backoff::{poll_until, FixedBackoffStrategy};
use crate::cluster::{control_plane_member, DatastoreRole, MembershipClient};
use crate::config::{ClusterConfig, Config};
use crate::datastore::{remove_node_from_datastore, DatastoreConnector, Removal};
use crate::node::NodeApi;

/// A request to remove one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemovalRequest {
    /// Name of the node to remove
    pub name: String,
    /// Keep going when a step fails
    pub force: bool,
    /// Deadline for the steps of the removal, counted from the start
    pub timeout: Option<Duration>,
}

impl RemovalRequest {
    /// Creates a request to remove `name` without force or timeout.
    pub fn new(name: impl Into<String>) -> Self {
        RemovalRequest {
            name: name.into(),
            force: false,
            timeout: None,
        }
    }

    /// Sets the force flag.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Sets the deadline every step has to finish within.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Errors returned by [`NodeRemover::remove_node`].
#[derive(Debug, Error)]
pub enum RemoveError {
    /// The consensus store could not tell whether the node is a control-plane node
    #[error("failed to determine if node is control-plane: {0:#}")]
    ControlPlaneLookup(anyhow::Error),
    /// The Kubernetes `Node` could not be deleted
    #[error("failed to remove node from Kubernetes: {0:#}")]
    Kubernetes(anyhow::Error),
    /// The datastore member could not be removed
    #[error("failed to delete node from datastore: {0:#}")]
    Datastore(anyhow::Error),
    /// The consensus store member could not be removed
    #[error("failed to delete node from cluster membership: {0:#}")]
    Membership(anyhow::Error),
    /// A step was still running when the request deadline passed
    #[error("node removal step did not finish within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
#[error("request deadline of {0:?} exceeded")]
struct DeadlineExceeded(Duration);

/// The point in time every step of a removal has to finish by.
#[derive(Clone, Copy, Debug)]
struct Deadline(Option<(Instant, Duration)>);

impl Deadline {
    fn starting_now(limit: Option<Duration>) -> Self {
        Deadline(
            limit
                .filter(|limit| *limit > Duration::ZERO)
                .map(|limit| (Instant::now() + limit, limit)),
        )
    }

    /// Runs `call`, failing it with [`DeadlineExceeded`] once the deadline passed.
    async fn run<T, F>(&self, call: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match self.0 {
            Some((at, limit)) => tokio::time::timeout_at(at, call)
                .await
                .unwrap_or_else(|_| Err(DeadlineExceeded(limit).into())),
            None => call.await,
        }
    }
}

/// Removes nodes from Kubernetes, the datastore and the consensus store.
pub struct NodeRemover {
    local_node: String,
    cluster: ClusterConfig,
    membership: Arc<dyn MembershipClient>,
    datastore: Arc<dyn DatastoreConnector>,
    nodes: Arc<dyn NodeApi>,
    pending_poll_interval: Duration,
    pending_poll_attempts: u32,
    final_removal_timeout: Duration,
}

impl NodeRemover {
    /// Creates a remover running on the member described by `config`.
    pub fn new(
        config: &Config,
        cluster: ClusterConfig,
        membership: Arc<dyn MembershipClient>,
        datastore: Arc<dyn DatastoreConnector>,
        nodes: Arc<dyn NodeApi>,
    ) -> Self {
        NodeRemover {
            local_node: config.node_name.clone(),
            cluster,
            membership,
            datastore,
            nodes,
            pending_poll_interval: config.pending_poll_interval,
            pending_poll_attempts: config.pending_poll_attempts,
            final_removal_timeout: config.final_removal_timeout,
        }
    }

    /// Removes the node named in `request` from the cluster.
    ///
    /// The steps run in a fixed order:
    ///
    /// 1. Ask the consensus store whether the node is a control-plane node.
    /// 2. Delete the Kubernetes `Node`, unless the cluster is annotated with
    ///    [`SKIP_CLEANUP_KUBERNETES_NODE_ON_REMOVE`](crate::config::SKIP_CLEANUP_KUBERNETES_NODE_ON_REMOVE).
    /// 3. For control-plane nodes, remove the datastore member.
    /// 4. For control-plane nodes, remove the consensus store member.
    ///
    /// With `force`, step failures are logged and the node is treated as a
    /// control-plane node, since the roster may already be out of step with
    /// the other systems.
    ///
    /// The request timeout applies to each call made by the steps. A step
    /// that misses it fails like any other step, so under `force` the later
    /// steps still run. The final consensus store removal is not bound by it,
    /// see [`best_effort_final_removal`].
    pub async fn remove_node(&self, request: &RemovalRequest) -> Result<(), RemoveError> {
        let span = info_span!("remove_node", node = %request.name, force = request.force);
        self.run(request, Deadline::starting_now(request.timeout))
            .instrument(span)
            .await
    }

    async fn run(&self, request: &RemovalRequest, deadline: Deadline) -> Result<(), RemoveError> {
        let name = request.name.as_str();
        let force = request.force;

        let lookup = deadline
            .run(control_plane_member(self.membership.as_ref(), name))
            .await;
        let is_control_plane = match lookup {
            Ok(member) => member.is_some(),
            Err(e) if force => {
                error!(
                    error = %format!("{:#}", e),
                    "Failed to determine if node is control-plane, but continuing due to force=true"
                );
                false
            }
            Err(e) => return Err(step_error(e, RemoveError::ControlPlaneLookup)),
        };

        if self.cluster.skip_kubernetes_node_cleanup() {
            info!("Skipping Kubernetes node removal as per annotation");
        } else {
            info!("Remove node from Kubernetes cluster");
            tolerate(
                force,
                deadline.run(self.nodes.delete_node(name)).await,
                "Kubernetes",
                RemoveError::Kubernetes,
            )?;
        }

        if !is_control_plane && !force {
            debug!("Node is not a control-plane node, nothing left to remove");
            return Ok(());
        }

        info!(datastore = ?self.cluster.datastore.kind, "Remove node from datastore");
        let removal = deadline
            .run(remove_node_from_datastore(
                self.membership.as_ref(),
                self.datastore.as_ref(),
                &self.cluster.datastore,
                name,
            ))
            .await
            .map(|removal| {
                if let Removal::Skipped(reason) = removal {
                    info!(reason, "Datastore member removal skipped");
                }
            });
        tolerate(force, removal, "datastore", RemoveError::Datastore)?;

        info!("Remove node from cluster membership");
        tolerate(
            force,
            self.remove_from_membership(name, force, deadline).await,
            "cluster membership",
            RemoveError::Membership,
        )?;

        Ok(())
    }

    async fn remove_from_membership(
        &self,
        name: &str,
        force: bool,
        deadline: Deadline,
    ) -> anyhow::Result<()> {
        let waited = deadline
            .run(async {
                self.wait_for_local_join().await;
                Ok(())
            })
            .await;
        if let Err(e) = waited {
            warn!(error = %e, "Stopped waiting for the local join. Continuing with the cleanup...");
        }

        // An empty address is accepted by the membership service. It is only
        // consulted when the name can no longer be resolved.
        let address = match deadline.run(self.membership.cluster_member(name)).await {
            Ok(member) => member.address,
            Err(e) => {
                error!(
                    error = %format!("{:#}", e),
                    "Failed to get the cluster member that is getting removed. Continuing with the cleanup..."
                );
                String::new()
            }
        };

        info!(address = %address, "Deleting node from cluster membership, for real");
        best_effort_final_removal(
            self.membership.clone(),
            name.to_string(),
            address,
            force,
            self.final_removal_timeout,
        )
        .await
        .map_err(|e| anyhow::anyhow!("failed to delete cluster member {}: {:#}", name, e))
    }

    /// Waits until the local member is no longer joining, so the removal
    /// does not race a join that is still in flight.
    async fn wait_for_local_join(&self) {
        let membership = self.membership.as_ref();
        let local = self.local_node.as_str();
        let mut backoff = FixedBackoffStrategy::new(self.pending_poll_interval);
        let ready = poll_until(&mut backoff, self.pending_poll_attempts, move |attempt| async move {
            debug!(attempt, "Waiting for node to finish cluster membership join before removing");
            match membership.cluster_member(local).await {
                Ok(member) => member.datastore_role != DatastoreRole::Pending,
                Err(e) => {
                    error!(
                        member = %local,
                        error = %format!("{:#}", e),
                        "Failed to get cluster member"
                    );
                    false
                }
            }
        })
        .await;
        if !ready {
            warn!(
                max_retries = self.pending_poll_attempts,
                "Reached maximum number of retries for cluster member role check. Continuing with the cleanup..."
            );
        }
    }
}

/// Issues the final cluster membership removal on a task of its own.
///
/// The membership service may abandon a removal between its pre-removal hook
/// and the roster update when the calling request is cancelled. The call
/// therefore runs detached from the caller and is bounded by `deadline`
/// instead. Dropping the returned future does not stop the removal.
pub async fn best_effort_final_removal(
    membership: Arc<dyn MembershipClient>,
    name: String,
    address: String,
    force: bool,
    deadline: Duration,
) -> anyhow::Result<()> {
    let task = tokio::spawn(async move {
        tokio::time::timeout(
            deadline,
            membership.remove_cluster_member(&name, &address, force),
        )
        .await
    });
    match task.await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(anyhow::anyhow!(
            "cluster member removal timed out after {:?}",
            deadline
        )),
        Err(e) => Err(anyhow::anyhow!("cluster member removal task failed: {}", e)),
    }
}

/// Turns a step failure into an error, or into a log line under force.
fn tolerate(
    force: bool,
    result: anyhow::Result<()>,
    step: &str,
    wrap: fn(anyhow::Error) -> RemoveError,
) -> Result<(), RemoveError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if force => {
            error!(
                step,
                error = %format!("{:#}", e),
                "Removal step failed, but continuing due to force=true"
            );
            Ok(())
        }
        Err(e) => Err(step_error(e, wrap)),
    }
}

fn step_error(e: anyhow::Error, wrap: fn(anyhow::Error) -> RemoveError) -> RemoveError {
    match e.downcast_ref::<DeadlineExceeded>() {
        Some(DeadlineExceeded(limit)) => RemoveError::Timeout(*limit),
        None => wrap(e),
    }
}
