//! A server framework for the Redis serialization protocol (RESP2).
//!
//! The crate decodes client commands, hands each one to a user supplied [`Handler`] and writes
//! the replies back, leaving command semantics to the application.
//!
//! ```no_run
//! use beam::handler::Router;
//! use beam::{Config, Reply, Server};
//!
//! # async fn run() -> beam::Result<()> {
//! let router = Router::new().route_fn("PING", |_req| Ok(Reply::simple("PONG")));
//! let server = Server::with_handler(Config::new("127.0.0.1:6379"), router);
//! server.serve().await
//! # }
//! ```

pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod context;
pub mod handler;
pub mod reply;
pub mod server;
mod session;
mod shutdown;

pub use command::Command;
pub use config::Config;
pub use context::{Attributes, SessionContext, Stats, StatsSnapshot};
pub use handler::{handler_fn, Handler, HandlerError, Request};
pub use reply::Reply;
pub use server::{Server, SessionInfo};
pub use session::Exit;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
