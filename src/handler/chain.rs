use std::sync::Arc;

use super::{Handler, HandlerError, Request};
use crate::reply::Reply;

/// Wraps a handler call. A middleware decides whether, when and how `next` runs, and may
/// rewrite its reply.
pub trait Middleware: Send + Sync {
    fn call(&self, request: &mut Request<'_>, next: &dyn Handler) -> Result<Reply, HandlerError>;
}

#[derive(Clone)]
pub struct MiddlewareFn<F> {
    f: F,
}

pub fn middleware_fn<F>(f: F) -> MiddlewareFn<F>
where
    F: Fn(&mut Request<'_>, &dyn Handler) -> Result<Reply, HandlerError> + Send + Sync,
{
    MiddlewareFn { f }
}

impl<F> Middleware for MiddlewareFn<F>
where
    F: Fn(&mut Request<'_>, &dyn Handler) -> Result<Reply, HandlerError> + Send + Sync,
{
    fn call(&self, request: &mut Request<'_>, next: &dyn Handler) -> Result<Reply, HandlerError> {
        (self.f)(request, next)
    }
}

/// A terminal handler wrapped by an ordered list of middlewares.
///
/// The first middleware added is the outermost one: it sees the request first and the reply
/// last. Composition happens once, in [`HandlerChainBuilder::build`].
pub struct HandlerChain {
    handler: Arc<dyn Handler>,
}

pub struct HandlerChainBuilder {
    handler: Arc<dyn Handler>,
    middlewares: Vec<Box<dyn Middleware>>,
}

impl HandlerChain {
    pub fn builder(handler: impl Handler + 'static) -> HandlerChainBuilder {
        HandlerChainBuilder {
            handler: Arc::new(handler),
            middlewares: Vec::new(),
        }
    }
}

impl HandlerChainBuilder {
    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> HandlerChainBuilder {
        self.middlewares.push(Box::new(middleware));
        self
    }

    pub fn build(self) -> HandlerChain {
        let handler = self
            .middlewares
            .into_iter()
            .rev()
            .fold(self.handler, |next, middleware| {
                Arc::new(Layer { middleware, next }) as Arc<dyn Handler>
            });

        HandlerChain { handler }
    }
}

impl Handler for HandlerChain {
    fn handle(&self, request: &mut Request<'_>) -> Result<Reply, HandlerError> {
        self.handler.handle(request)
    }
}

struct Layer {
    middleware: Box<dyn Middleware>,
    next: Arc<dyn Handler>,
}

impl Handler for Layer {
    fn handle(&self, request: &mut Request<'_>) -> Result<Reply, HandlerError> {
        self.middleware.call(request, self.next.as_ref())
    }
}
