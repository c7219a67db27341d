//! Request handling: the [`Handler`] contract, the [`Request`] it receives, middleware
//! composition and name based routing.

mod chain;
mod router;

pub use chain::{middleware_fn, HandlerChain, HandlerChainBuilder, Middleware, MiddlewareFn};
pub use router::Router;

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error as ThisError;
use uuid::Uuid;

use crate::command::Command;
use crate::context::{SessionContext, Stats};
use crate::reply::Reply;

/// Turns a command into a reply.
///
/// Handlers are shared by every session of a server and called concurrently from their tasks,
/// hence `Send + Sync`. State that belongs to a single client goes in the request's session
/// attributes.
pub trait Handler: Send + Sync {
    fn handle(&self, request: &mut Request<'_>) -> Result<Reply, HandlerError>;
}

#[derive(Debug, ThisError)]
pub enum HandlerError {
    /// Reply `-ERR connection is closed by the server` and close the connection.
    #[error("client halted by the handler")]
    Halt,
    /// No route for the command name.
    #[error("no handler found for command '{0}'")]
    NotFound(String),
    #[error(transparent)]
    Failed(#[from] crate::Error),
}

impl HandlerError {
    pub fn failed(err: impl Into<crate::Error>) -> HandlerError {
        HandlerError::Failed(err.into())
    }

    pub fn is_halt(&self) -> bool {
        matches!(self, HandlerError::Halt)
    }
}

/// A command together with the context of the session that sent it.
pub struct Request<'a> {
    command: Command,
    session: &'a mut SessionContext,
}

impl<'a> Request<'a> {
    pub fn new(command: Command, session: &'a mut SessionContext) -> Request<'a> {
        Request { command, session }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn name(&self) -> &Bytes {
        self.command.name()
    }

    /// Part at `index` of the command; `0` is the name.
    pub fn get(&self, index: usize) -> Option<&Bytes> {
        self.command.get(index)
    }

    pub fn get_str(&self, index: usize) -> Option<&str> {
        self.command.get_str(index)
    }

    pub fn args(&self) -> &[Bytes] {
        self.command.args()
    }

    pub fn session(&self) -> &SessionContext {
        self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionContext {
        self.session
    }

    pub fn session_id(&self) -> Uuid {
        self.session.id()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.session.remote_addr()
    }

    pub fn stats(&self) -> &Stats {
        self.session.stats()
    }

    pub fn get_attr<T: Any>(&self, key: &str) -> Option<&T> {
        self.session.attributes().get(key)
    }

    pub fn set_attr<T: Any + Send>(&mut self, key: impl Into<String>, value: T) {
        self.session.attributes_mut().set(key, value)
    }

    pub fn has_attr(&self, key: &str) -> bool {
        self.session.attributes().has(key)
    }

    pub fn remove_attr(&mut self, key: &str) -> bool {
        self.session.attributes_mut().remove(key)
    }
}

#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Wraps a closure into a [`Handler`].
///
/// ```
/// use beam::handler::handler_fn;
/// use beam::Reply;
///
/// let pong = handler_fn(|_req| Ok(Reply::simple("PONG")));
/// ```
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(&mut Request<'_>) -> Result<Reply, HandlerError> + Send + Sync,
{
    HandlerFn { f }
}

impl<F> Handler for HandlerFn<F>
where
    F: Fn(&mut Request<'_>) -> Result<Reply, HandlerError> + Send + Sync,
{
    fn handle(&self, request: &mut Request<'_>) -> Result<Reply, HandlerError> {
        (self.f)(request)
    }
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn handle(&self, request: &mut Request<'_>) -> Result<Reply, HandlerError> {
        (**self).handle(request)
    }
}

impl<H: Handler + ?Sized> Handler for Box<H> {
    fn handle(&self, request: &mut Request<'_>) -> Result<Reply, HandlerError> {
        (**self).handle(request)
    }
}
