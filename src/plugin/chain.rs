//! Middleware chain execution
//!
//! An entry point's middlewares run in registry (load) order. Each one
//! receives the rest of the chain as its `next` handler, and the last
//! `next` is the entry point's terminal handler.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

use crate::http::{ProxyRequest, ResponseWriter};
use crate::plugin::middleware::{Handler, Middleware};

/// Ordered middlewares in front of a terminal handler
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
    terminal: Arc<dyn Handler>,
}

impl MiddlewareChain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>, terminal: Arc<dyn Handler>) -> Self {
        Self {
            middlewares,
            terminal,
        }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

#[async_trait]
impl Handler for MiddlewareChain {
    async fn serve(&self, req: &mut ProxyRequest, rw: &mut dyn ResponseWriter) {
        let link = Link {
            rest: &self.middlewares,
            terminal: self.terminal.as_ref(),
        };
        link.serve(req, rw).await
    }
}

/// The part of the chain that has not run yet
struct Link<'a> {
    rest: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn Handler,
}

#[async_trait]
impl Handler for Link<'_> {
    async fn serve(&self, req: &mut ProxyRequest, rw: &mut dyn ResponseWriter) {
        match self.rest.split_first() {
            Some((middleware, rest)) => {
                trace!(plugin = middleware.name(), remaining = rest.len(), "Entering middleware");
                let next = Link {
                    rest,
                    terminal: self.terminal,
                };
                middleware.handle(req, rw, &next).await
            }
            None => self.terminal.serve(req, rw).await,
        }
    }
}
