//! `node` wraps the Kubernetes node API used when a node leaves the cluster.
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node as KubeNode;
use kube::api::{Api, DeleteParams};
use kube::error::ErrorResponse;
use kube::Error;
use tracing::{debug, info};

/// Deletes Kubernetes `Node` objects.
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Deletes the node called `name`. A node that does not exist is treated
    /// as deleted.
    async fn delete_node(&self, name: &str) -> anyhow::Result<()>;
}

/// [`NodeApi`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeNodes {
    client: kube::Client,
}

impl KubeNodes {
    /// Creates the node API on top of `client`.
    pub fn new(client: kube::Client) -> Self {
        KubeNodes { client }
    }
}

#[async_trait]
impl NodeApi for KubeNodes {
    async fn delete_node(&self, name: &str) -> anyhow::Result<()> {
        let node_client: Api<KubeNode> = Api::all(self.client.clone());
        info!(node = %name, "Deleting node from Kubernetes cluster");
        match node_client.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(Error::Api(ErrorResponse { code: 404, .. })) => {
                debug!(node = %name, "Node already absent from Kubernetes");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("failed to remove k8s node {:?}: {}", name, e)),
        }
    }
}
