//! Built-in handlers.

use async_trait::async_trait;
use tracing::info;

use crate::dispatch::Handler;
use crate::error::HandlerError;
use crate::identity::Identity;
use crate::message::{Body, EchoPayload, Envelope, InitPayload};

/// Length of the ids handed out by [`Generate`].
const GENERATED_ID_LEN: usize = 21;

/// `init`: records the node's id and cluster membership, replies `init_ok`.
pub struct Init;

#[async_trait]
impl Handler for Init {
    async fn handle(
        &self,
        request: &Envelope,
        node: &Identity,
    ) -> Result<Option<Body>, HandlerError> {
        let payload: InitPayload = request
            .body
            .decode()
            .map_err(|err| HandlerError::malformed("init", err))?;

        let InitPayload { node_id, node_ids } = payload;
        node.init(node_id, node_ids)?;
        info!(
            node_id = node.node_id().unwrap_or_default(),
            peers = node.peers().count(),
            "node initialized"
        );

        Ok(Some(Body::new("init_ok")))
    }
}

/// `echo`: replies `echo_ok` carrying the request's `echo` value unchanged.
///
/// Answers before `init` too; the reply then goes out under the address the
/// request was sent to.
pub struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn handle(
        &self,
        request: &Envelope,
        _node: &Identity,
    ) -> Result<Option<Body>, HandlerError> {
        let EchoPayload { echo } = request
            .body
            .decode()
            .map_err(|err| HandlerError::malformed("echo", err))?;

        Ok(Some(Body::new("echo_ok").with("echo", echo)))
    }
}

/// `generate`: replies `generate_ok` with a fresh, globally unique `id`.
///
/// Needs no node state beyond the reply addressing done by the registry.
pub struct Generate;

#[async_trait]
impl Handler for Generate {
    async fn handle(
        &self,
        _request: &Envelope,
        _node: &Identity,
    ) -> Result<Option<Body>, HandlerError> {
        let id = nanoid::nanoid!(GENERATED_ID_LEN);
        Ok(Some(Body::new("generate_ok").with("id", id)))
    }
}
