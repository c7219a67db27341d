use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{handler_fn, Handler, HandlerError, Request};
use crate::reply::Reply;

/// Dispatches on the command name, ignoring ASCII case.
///
/// Routes are registered while building the router. A name with no route fails with
/// [`HandlerError::NotFound`].
#[derive(Default, Clone)]
pub struct Router {
    routes: HashMap<Vec<u8>, Arc<dyn Handler>>,
}

impl Router {
    pub fn new() -> Router {
        Router::default()
    }

    /// Registers `handler` for `name`, replacing any previous route with the same name.
    pub fn route(mut self, name: impl AsRef<[u8]>, handler: impl Handler + 'static) -> Router {
        self.routes
            .insert(name.as_ref().to_ascii_uppercase(), Arc::new(handler));
        self
    }

    pub fn route_fn<F>(self, name: impl AsRef<[u8]>, f: F) -> Router
    where
        F: Fn(&mut Request<'_>) -> Result<Reply, HandlerError> + Send + Sync + 'static,
    {
        self.route(name, handler_fn(f))
    }

    pub fn lookup(&self, name: &[u8]) -> Option<&Arc<dyn Handler>> {
        self.routes.get(name.to_ascii_uppercase().as_slice())
    }

    /// Registered names, uppercase and sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .routes
            .keys()
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Handler for Router {
    fn handle(&self, request: &mut Request<'_>) -> Result<Reply, HandlerError> {
        match self.lookup(request.name()) {
            Some(handler) => handler.handle(request),
            None => Err(HandlerError::NotFound(
                String::from_utf8_lossy(request.name()).into_owned(),
            )),
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.names())
            .finish()
    }
}
