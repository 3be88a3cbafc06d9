//! Configuration for membership operations
//!
//! The best way to configure the daemon side is by using
//! [`Config::default_config`], or by turning on the "cli" feature and using
//! [`Opts`]. The cluster-wide settings that come from the cluster database
//! are described by [`ClusterConfig`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
#[cfg(feature = "cli")]
use structopt::StructOpt;

use crate::fsutil::Owner;

const DEFAULT_STATE_DIR: &str = "/var/snap/k8s/common/var/lib/k8sd/state";
const DEFAULT_PENDING_POLL_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_PENDING_POLL_ATTEMPTS: u32 = 10;
const DEFAULT_FINAL_REMOVAL_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_DATASTORE_PORT: u16 = 2379;

/// Annotation on the cluster configuration that makes node removal leave the
/// Kubernetes `Node` object alone.
pub const SKIP_CLEANUP_KUBERNETES_NODE_ON_REMOVE: &str =
    "k8sd/v1alpha/lifecycle/skip-cleanup-kubernetes-node-on-remove";

/// The local settings of the k8sd instance performing membership changes.
#[derive(Clone, Debug)]
pub struct Config {
    /// The name of this cluster member
    pub node_name: String,
    /// The k8sd state directory
    pub state_dir: PathBuf,
    /// How long to wait between checks of the local member's role
    pub pending_poll_interval: Duration,
    /// How many times to check the local member's role before giving up
    pub pending_poll_attempts: u32,
    /// Deadline of the final cluster membership removal call
    pub final_removal_timeout: Duration,
    /// Owner given to files written on behalf of the daemon
    pub owner: Option<Owner>,
}

impl Config {
    /// Returns a Config object set with all of the defaults.
    pub fn default_config() -> anyhow::Result<Self> {
        Ok(Config {
            node_name: sanitize_hostname(&default_hostname()?),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            pending_poll_interval: DEFAULT_PENDING_POLL_INTERVAL,
            pending_poll_attempts: DEFAULT_PENDING_POLL_ATTEMPTS,
            final_removal_timeout: DEFAULT_FINAL_REMOVAL_TIMEOUT,
            owner: None,
        })
    }

    /// Builds the configuration from parsed command line options.
    #[cfg(any(feature = "cli", feature = "docs"))]
    #[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
    pub fn from_opts(opts: &Opts) -> anyhow::Result<Self> {
        let node_name = match &opts.node_name {
            Some(name) => name.clone(),
            None => sanitize_hostname(&default_hostname()?),
        };
        let owner = match (opts.uid, opts.gid) {
            (Some(uid), Some(gid)) => Some(Owner { uid, gid }),
            (None, None) => None,
            _ => anyhow::bail!("--uid and --gid must be set together"),
        };
        Ok(Config {
            node_name,
            state_dir: opts.state_dir.clone(),
            owner,
            ..Config::default_config()?
        })
    }
}

/// Which datastore backs the Kubernetes API of the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatastoreKind {
    /// etcd members run on the control-plane nodes and are managed by k8sd
    #[serde(alias = "etcd")]
    Embedded,
    /// The datastore is run by the administrator outside of the cluster
    External,
}

impl Default for DatastoreKind {
    fn default() -> Self {
        DatastoreKind::Embedded
    }
}

/// Datastore settings read by membership operations. Client credentials
/// are the business of the [`DatastoreConnector`](crate::datastore::DatastoreConnector).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatastoreConfig {
    /// The datastore type
    #[serde(rename = "type", default)]
    pub kind: DatastoreKind,
    /// Client port of the embedded datastore members
    #[serde(default)]
    pub port: Option<u16>,
}

impl DatastoreConfig {
    /// The client port of embedded datastore members.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_DATASTORE_PORT)
    }
}

/// The parts of the cluster configuration read by membership operations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Datastore settings
    #[serde(default)]
    pub datastore: DatastoreConfig,
    /// Cluster annotations
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl ClusterConfig {
    /// Whether removing a node should leave its Kubernetes `Node` in place.
    pub fn skip_kubernetes_node_cleanup(&self) -> bool {
        self.annotations
            .contains_key(SKIP_CLEANUP_KUBERNETES_NODE_ON_REMOVE)
    }
}

/// CLI options of the k8sd binary
#[derive(StructOpt, Clone, Debug)]
#[cfg(any(feature = "cli", feature = "docs"))]
#[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
#[structopt(name = "k8sd", about = "Cluster membership daemon for Kubernetes")]
pub struct Opts {
    /// The k8sd state directory
    #[structopt(
        long = "state-dir",
        env = "K8SD_STATE_DIR",
        default_value = DEFAULT_STATE_DIR,
        help = "Directory holding the k8sd database, trust store and daemon configuration"
    )]
    pub state_dir: PathBuf,

    /// The name of this cluster member
    #[structopt(
        long = "node-name",
        env = "K8SD_NODE_NAME",
        help = "The name of this cluster member, defaults to the hostname of this machine"
    )]
    pub node_name: Option<String>,

    /// Owner uid of files written by the daemon
    #[structopt(long = "uid", env = "K8SD_UID")]
    pub uid: Option<u32>,

    /// Owner gid of files written by the daemon
    #[structopt(long = "gid", env = "K8SD_GID")]
    pub gid: Option<u32>,

    /// The command to run
    #[structopt(subcommand)]
    pub command: Command,
}

/// Commands of the k8sd binary
#[derive(StructOpt, Clone, Debug)]
#[cfg(any(feature = "cli", feature = "docs"))]
#[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
pub enum Command {
    /// Recover the cluster from this member if quorum is lost
    #[structopt(name = "cluster-recover")]
    ClusterRecover {
        /// Disable interactive prompts and assume the configs have been updated
        #[structopt(long = "non-interactive")]
        non_interactive: bool,
    },
}

fn default_hostname() -> anyhow::Result<String> {
    hostname::get()?
        .into_string()
        .map_err(|_| anyhow::anyhow!("invalid utf-8 hostname string"))
}

// Some hostnames (particularly local ones) can have uppercase letters, which is
// not allowed in kubernetes object names (RFC 1123).
fn sanitize_hostname(hostname: &str) -> String {
    hostname.to_lowercase()
}
