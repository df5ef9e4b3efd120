//! Routing of requests to handlers by their `type` tag.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{DispatchError, HandlerError};
use crate::handlers::{Echo, Generate, Init};
use crate::identity::Identity;
use crate::message::{Body, Envelope};

/// Logic for one message type.
///
/// A handler returns the body of its reply, or `None` when the request
/// needs no answer. Addressing and message ids are filled in by the
/// [`Registry`], so a handler only touches [`Identity`] when its semantics
/// require it.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        request: &Envelope,
        node: &Identity,
    ) -> Result<Option<Body>, HandlerError>;
}

/// Handler table keyed by message type. Built once at startup.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `init`, `echo` and `generate` handlers.
    pub fn with_defaults() -> Self {
        Self::new()
            .register("init", Init)
            .register("echo", Echo)
            .register("generate", Generate)
    }

    /// Adds a handler, replacing any handler previously registered for `tag`.
    pub fn register<H>(mut self, tag: impl Into<String>, handler: H) -> Self
    where
        H: Handler + 'static,
    {
        self.handlers.insert(tag.into(), Arc::new(handler));
        self
    }

    /// Registered tags in sorted order.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    pub async fn dispatch(
        &self,
        request: &Envelope,
        node: &Identity,
    ) -> Result<Option<Envelope>, DispatchError> {
        let tag = request.body.kind.as_str();
        let handler = self
            .handlers
            .get(tag)
            .ok_or_else(|| DispatchError::UnknownType {
                tag: tag.to_string(),
            })?;

        debug!(msg_type = tag, msg_id = ?request.body.msg_id, src = %request.src, "dispatching");
        let reply = handler.handle(request, node).await?;
        Ok(reply.map(|body| node.reply(request, body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ErrorCode;

    struct Silent;

    #[async_trait]
    impl Handler for Silent {
        async fn handle(&self, _: &Envelope, _: &Identity) -> Result<Option<Body>, HandlerError> {
            Ok(None)
        }
    }

    struct Refuse;

    #[async_trait]
    impl Handler for Refuse {
        async fn handle(&self, _: &Envelope, _: &Identity) -> Result<Option<Body>, HandlerError> {
            Err(HandlerError::Rejected {
                code: ErrorCode::Abort,
                text: "refused".into(),
            })
        }
    }

    fn request(kind: &str) -> Envelope {
        Envelope {
            src: "c1".into(),
            dest: "n1".into(),
            body: Body {
                msg_id: Some(9),
                ..Body::new(kind)
            },
        }
    }

    #[test]
    fn defaults_cover_builtin_types() {
        let registry = Registry::with_defaults();
        assert_eq!(registry.tags(), vec!["echo", "generate", "init"]);
    }

    #[tokio::test]
    async fn unknown_tag_is_reported() {
        let registry = Registry::with_defaults();
        let result = registry.dispatch(&request("bogus"), &Identity::new()).await;
        assert!(matches!(
            result,
            Err(DispatchError::UnknownType { tag }) if tag == "bogus"
        ));
    }

    #[tokio::test]
    async fn handler_without_reply_allocates_no_id() {
        let registry = Registry::new().register("gossip", Silent);
        let identity = Identity::new();
        let result = registry.dispatch(&request("gossip"), &identity).await;
        assert!(matches!(result, Ok(None)));
        assert_eq!(identity.allocated(), 0);
    }

    #[tokio::test]
    async fn handler_errors_are_forwarded() {
        let registry = Registry::new().register("cas", Refuse);
        let result = registry.dispatch(&request("cas"), &Identity::new()).await;
        match result {
            Err(DispatchError::Handler(err)) => assert_eq!(err.code(), ErrorCode::Abort),
            other => panic!("unexpected dispatch result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn later_registration_replaces_earlier() {
        let registry = Registry::with_defaults().register("echo", Silent);
        let result = registry.dispatch(&request("echo"), &Identity::new()).await;
        assert!(matches!(result, Ok(None)));
    }
}
