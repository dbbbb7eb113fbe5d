// Maps consumer failures to dispositions.
use std::error::Error as StdError;

use crate::message::{MessageContext, MessageResponse};

type HandlerFn =
    Box<dyn Fn(&(dyn StdError + 'static), &MessageContext) -> Option<MessageResponse> + Send + Sync>;

/// Resolves a raised consumer failure to a [`MessageResponse`].
///
/// Handlers register against concrete error types. Resolution walks the
/// failure's source chain outermost-first; at each level the handlers are
/// consulted in registration order and the first match wins, so a handler
/// for a wrapping error always beats a handler for one of its causes. A
/// failure no handler matches is logged at error level and retried.
pub struct ExceptionResolver {
    handlers: Vec<HandlerFn>,
}

impl ExceptionResolver {
    pub fn builder() -> ExceptionResolverBuilder {
        ExceptionResolverBuilder {
            handlers: Vec::new(),
        }
    }

    /// Resolver with no handlers: every failure maps to retry.
    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn resolve(&self, failure: &anyhow::Error, context: &MessageContext) -> MessageResponse {
        for cause in failure.chain() {
            for handler in &self.handlers {
                if let Some(response) = handler(cause, context) {
                    return response;
                }
            }
        }
        tracing::error!(
            message_id = %context.message_id(),
            error = %failure,
            "no handler for consumer failure; retrying"
        );
        metrics::counter!("queuebacca_unhandled_failures_total").increment(1);
        MessageResponse::Retry
    }
}

impl Default for ExceptionResolver {
    fn default() -> Self {
        Self::empty()
    }
}

pub struct ExceptionResolverBuilder {
    handlers: Vec<HandlerFn>,
}

impl ExceptionResolverBuilder {
    /// Register a handler for failures of type `E`, including failures
    /// whose source chain contains an `E`.
    pub fn on<E, F>(mut self, handler: F) -> Self
    where
        E: StdError + Send + Sync + 'static,
        F: Fn(&E, &MessageContext) -> MessageResponse + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(move |cause, context| {
            cause.downcast_ref::<E>().map(|err| handler(err, context))
        }));
        self
    }

    pub fn build(self) -> ExceptionResolver {
        ExceptionResolver {
            handlers: self.handlers,
        }
    }
}
