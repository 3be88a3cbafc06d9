//! Membership changes and disaster recovery for k8sd cluster members.
//!
//! A k8sd cluster keeps three membership views in step: the Kubernetes
//! `Node` objects, the roster of the embedded consensus store (dqlite) and,
//! when one is used, the member list of the etcd datastore. This crate holds
//! the logic that changes those views together:
//!
//! * [`remove::NodeRemover`] removes a node from all three views, optionally
//!   on a best-effort basis.
//! * [`revert::Reverter`] collects compensating actions while a node joins
//!   and runs them in reverse if the join fails.
//! * [`recover::RecoveryWorkflow`] rewrites the consensus store membership
//!   after a permanent loss of quorum.
//!
//! The external systems are reached through the traits in [`cluster`],
//! [`datastore`] and [`node`], so the orchestration can run against fakes.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use membership::config::{ClusterConfig, Config};
//! use membership::node::KubeNodes;
//! use membership::remove::{NodeRemover, RemovalRequest};
//! # use membership::cluster::{ClusterMember, MembershipClient};
//! # use membership::datastore::{DatastoreClient, DatastoreConnector};
//! # struct Microcluster;
//! # #[async_trait::async_trait]
//! # impl MembershipClient for Microcluster {
//! #     async fn cluster_members(&self) -> anyhow::Result<Vec<ClusterMember>> { todo!() }
//! #     async fn cluster_member(&self, name: &str) -> anyhow::Result<ClusterMember> { todo!() }
//! #     async fn remove_cluster_member(&self, name: &str, address: &str, force: bool) -> anyhow::Result<()> { todo!() }
//! # }
//! # struct Etcd;
//! # #[async_trait::async_trait]
//! # impl DatastoreConnector for Etcd {
//! #     async fn connect(&self, endpoints: &[String]) -> anyhow::Result<Box<dyn DatastoreClient>> { todo!() }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = kube::Client::try_default().await?;
//!     let remover = NodeRemover::new(
//!         &Config::default_config()?,
//!         ClusterConfig::default(),
//!         Arc::new(Microcluster),
//!         Arc::new(Etcd),
//!         Arc::new(KubeNodes::new(client)),
//!     );
//!     remover.remove_node(&RemovalRequest::new("worker-1")).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(feature = "docs", feature(doc_cfg))]

pub mod backoff;
pub mod cluster;
pub mod config;
pub mod datastore;
pub mod fsutil;
pub mod node;
pub mod quorum;
pub mod recover;
pub mod remove;
pub mod revert;

#[cfg(test)]
pub(crate) mod test_utils;

#[doc(inline)]
pub use recover::RecoveryWorkflow;
#[doc(inline)]
pub use remove::NodeRemover;
#[doc(inline)]
pub use revert::Reverter;
