//! Compensating actions for multi-step operations such as a node join.
//!
//! Every step of a join that changes shared state registers an action that
//! undoes it. If the join fails, [`Reverter::fail`] runs the actions newest
//! first. If it succeeds, [`Reverter::success`] drops them unrun.
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tracing::{debug, error, info, warn};

mod join;

pub use join::{
    register_datastore_member_reverter, register_dqlite_state_reverter,
    register_kubernetes_node_reverter,
};

/// Boxed future returned by a compensating action.
pub type RevertFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// The system a compensating action cleans up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompensationKind {
    /// The local consensus store directory
    DqliteState,
    /// The node's membership in the datastore
    DatastoreMember,
    /// The node's Kubernetes `Node` object
    KubernetesNode,
}

impl fmt::Display for CompensationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompensationKind::DqliteState => "dqlite-state",
            CompensationKind::DatastoreMember => "datastore-member",
            CompensationKind::KubernetesNode => "kubernetes-node",
        };
        f.write_str(name)
    }
}

/// A registered rollback step.
pub struct CompensatingAction {
    kind: CompensationKind,
    target: String,
    execute: Box<dyn FnOnce() -> RevertFuture + Send>,
}

impl CompensatingAction {
    /// Creates an action of `kind` acting on `target`.
    pub fn new<F, Fut>(kind: CompensationKind, target: impl Into<String>, execute: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        CompensatingAction {
            kind,
            target: target.into(),
            execute: Box::new(move || Box::pin(execute())),
        }
    }

    /// The system this action cleans up.
    pub fn kind(&self) -> CompensationKind {
        self.kind
    }

    /// What the action acts on, used for logging.
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl fmt::Debug for CompensatingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompensatingAction")
            .field("kind", &self.kind)
            .field("target", &self.target)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RevertState {
    Armed,
    Fired,
    Disarmed,
}

/// An ordered set of compensating actions owned by one join attempt.
///
/// The reverter is armed until either [`fail`](Reverter::fail) or
/// [`success`](Reverter::success) is called. Both are terminal, any further
/// call to either is a no-op.
#[derive(Debug)]
pub struct Reverter {
    actions: Vec<CompensatingAction>,
    state: RevertState,
}

impl Default for Reverter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reverter {
    /// Creates an armed reverter with no actions.
    pub fn new() -> Self {
        Reverter {
            actions: Vec::new(),
            state: RevertState::Armed,
        }
    }

    /// Registers `action` to run if the operation fails.
    pub fn add(&mut self, action: CompensatingAction) {
        if self.state != RevertState::Armed {
            warn!(
                kind = %action.kind,
                target = %action.target,
                "Ignoring compensating action registered after the reverter completed"
            );
            return;
        }
        debug!(kind = %action.kind, target = %action.target, "Registered compensating action");
        self.actions.push(action);
    }

    /// The registered actions in registration order.
    pub fn actions(&self) -> impl Iterator<Item = (CompensationKind, &str)> {
        self.actions.iter().map(|a| (a.kind, a.target.as_str()))
    }

    /// Whether neither `fail` nor `success` has been called yet.
    pub fn is_armed(&self) -> bool {
        self.state == RevertState::Armed
    }

    /// Runs every registered action, most recently registered first.
    ///
    /// An action that fails is logged and the remaining actions still run.
    pub async fn fail(&mut self) {
        if self.state != RevertState::Armed {
            return;
        }
        self.state = RevertState::Fired;
        let actions = std::mem::take(&mut self.actions);
        info!(count = actions.len(), "Reverting failed operation");
        for action in actions.into_iter().rev() {
            let CompensatingAction {
                kind,
                target,
                execute,
            } = action;
            debug!(kind = %kind, target = %target, "Running compensating action");
            if let Err(e) = execute().await {
                error!(kind = %kind, target = %target, error = %format!("{:#}", e), "Compensating action failed");
            }
        }
    }

    /// Drops every registered action without running it.
    pub fn success(&mut self) {
        if self.state != RevertState::Armed {
            return;
        }
        self.state = RevertState::Disarmed;
        self.actions.clear();
    }
}

impl Drop for Reverter {
    fn drop(&mut self) {
        if self.state == RevertState::Armed && !self.actions.is_empty() {
            warn!(
                count = self.actions.len(),
                "Reverter dropped while armed, compensating actions were not run"
            );
        }
    }
}
