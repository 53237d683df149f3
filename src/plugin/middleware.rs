use async_trait::async_trait;

use crate::http::{ProxyRequest, ResponseWriter};

/// Anything that can complete an HTTP transaction: the rest of a chain, an
/// upstream forwarder, a test stub
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, req: &mut ProxyRequest, rw: &mut dyn ResponseWriter);
}

/// Capability every loaded plugin provides
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Entry point the plugin was declared for
    fn name(&self) -> &str;

    /// Handle one transaction. `next` runs the remainder of the chain and
    /// must be called at most once.
    async fn handle(&self, req: &mut ProxyRequest, rw: &mut dyn ResponseWriter, next: &dyn Handler);

    /// Release the plugin's resources. Safe to call more than once.
    fn stop(&self);
}

/// Adapts a synchronous closure into a `Handler`
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: Fn(&mut ProxyRequest, &mut dyn ResponseWriter) + Send + Sync,
{
    async fn serve(&self, req: &mut ProxyRequest, rw: &mut dyn ResponseWriter) {
        (self.0)(req, rw)
    }
}
