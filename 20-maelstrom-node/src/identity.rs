//! Node-local identity shared by every worker.
//!
//! The topology is a write-once cell filled by the first `init`; the
//! outgoing message counter is a single atomic so concurrent handlers never
//! observe the same id.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    OnceLock,
};

use crate::error::HandlerError;
use crate::message::{Body, Envelope};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub node_id: String,
    /// Every node in the cluster, including this one.
    pub node_ids: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Identity {
    topology: OnceLock<Topology>,
    next_msg_id: AtomicU64,
}

impl Identity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the node's id and cluster membership.
    ///
    /// Only the first call succeeds. A later call, even with identical
    /// values, is rejected and leaves the stored topology unchanged.
    pub fn init(&self, node_id: String, node_ids: Vec<String>) -> Result<(), HandlerError> {
        if !node_ids.contains(&node_id) {
            return Err(HandlerError::malformed(
                "init",
                format!("node_ids does not contain {node_id}"),
            ));
        }

        self.topology
            .set(Topology { node_id, node_ids })
            .map_err(|_| HandlerError::AlreadyInitialized {
                node_id: self.node_id().unwrap_or_default().to_string(),
            })
    }

    pub fn node_id(&self) -> Option<&str> {
        self.topology.get().map(|topology| topology.node_id.as_str())
    }

    /// All cluster members, or an empty slice before init.
    pub fn node_ids(&self) -> &[String] {
        self.topology
            .get()
            .map(|topology| topology.node_ids.as_slice())
            .unwrap_or_default()
    }

    /// Cluster members other than this node.
    pub fn peers(&self) -> impl Iterator<Item = &str> {
        let own = self.node_id();
        self.node_ids()
            .iter()
            .map(String::as_str)
            .filter(move |id| Some(*id) != own)
    }

    /// Allocates the next outgoing message id. The first id is 1.
    pub fn next_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of ids handed out so far.
    pub fn allocated(&self) -> u64 {
        self.next_msg_id.load(Ordering::Relaxed)
    }

    /// Wraps `body` into a reply addressed to the sender of `request`.
    ///
    /// Before init the reply goes out under the address the request was
    /// sent to.
    pub fn reply(&self, request: &Envelope, mut body: Body) -> Envelope {
        body.msg_id = Some(self.next_msg_id());
        body.in_reply_to = request.body.msg_id;
        Envelope {
            src: self.node_id().unwrap_or(&request.dest).to_string(),
            dest: request.src.clone(),
            body,
        }
    }
}
