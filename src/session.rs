use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use strum_macros::Display;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::command::Command;
use crate::config::Config;
use crate::connection::{self, Connection, Read};
use crate::context::SessionContext;
use crate::handler::{Handler, HandlerError, Request};
use crate::reply::Reply;
use crate::shutdown::Shutdown;

const NO_HANDLER: &str = "ERR a handler must be provided";
const INTERNAL_ERROR: &str = "ERR internal server error";
const HALTED: &str = "ERR connection is closed by the server";

/// Why a session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Exit {
    /// The server is closing.
    Shutdown,
    /// The session was disconnected through the server registry.
    Stopped,
    /// No command was received within the idle timeout.
    IdleTimeout,
    /// The client closed the connection.
    Eof,
    /// A handler halted the client.
    Halted,
    /// The server has no handler to run commands with.
    NoHandler,
}

/// Drives one client connection: read, decode, dispatch, reply, until something ends it.
pub struct Session {
    connection: Connection,
    context: SessionContext,
    handler: Option<Arc<dyn Handler>>,
    shutdown: Shutdown,
    stop: Shutdown,
    rw_timeout: Duration,
    idle_timeout: Duration,
}

impl Session {
    pub(crate) fn new(
        connection: Connection,
        context: SessionContext,
        handler: Option<Arc<dyn Handler>>,
        shutdown: Shutdown,
        stop: Shutdown,
        config: &Config,
    ) -> Session {
        Session {
            connection,
            context,
            handler,
            shutdown,
            stop,
            rw_timeout: config.rw_timeout,
            idle_timeout: config.idle_timeout,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Runs the session to completion. The connection is closed when this returns.
    ///
    /// Shutdown and disconnect requests are checked between reads, so they take effect once
    /// the read in flight returns or times out.
    pub async fn run(mut self) -> Result<Exit, connection::Error> {
        let mut idle_deadline = Instant::now() + self.idle_timeout;

        loop {
            if self.shutdown.is_shutdown() {
                return Ok(Exit::Shutdown);
            }
            if self.stop.is_shutdown() {
                return Ok(Exit::Stopped);
            }
            if Instant::now() >= idle_deadline {
                debug!(timeout = ?self.idle_timeout, "idle timeout");
                return Ok(Exit::IdleTimeout);
            }

            match self.connection.read(self.rw_timeout).await? {
                Read::Data(n) => self.context.stats().record_read(n),
                Read::TimedOut => continue,
                Read::Eof => {
                    let pending = self.connection.pending();
                    if pending > 0 {
                        debug!(pending, "client closed the connection in the middle of a frame");
                    }
                    return Ok(Exit::Eof);
                }
            }

            let commands = match self.connection.decode() {
                Ok(commands) => commands,
                Err(err @ connection::Error::Oversized { .. }) => {
                    warn!(cause = %err, "rejecting oversized command");
                    return Err(err);
                }
                Err(err) => return Err(err),
            };
            if commands.is_empty() {
                continue;
            }

            idle_deadline = Instant::now() + self.idle_timeout;
            self.context.stats().record_commands(commands.len());

            let (replies, exit) = self.dispatch(commands);
            self.connection.write(&replies, self.rw_timeout).await?;
            self.context.stats().record_write(replies.len());

            if let Some(exit) = exit {
                return Ok(exit);
            }
        }
    }

    // Runs a batch in order and concatenates the replies. Commands after one that ends the
    // session are not run.
    fn dispatch(&mut self, commands: Vec<Command>) -> (BytesMut, Option<Exit>) {
        let mut replies = BytesMut::new();

        for command in commands {
            debug!(%command, "dispatching");
            let (reply, exit) = self.call(command);
            replies.extend_from_slice(reply.as_bytes());

            if exit.is_some() {
                return (replies, exit);
            }
        }

        (replies, None)
    }

    fn call(&mut self, command: Command) -> (Reply, Option<Exit>) {
        let Some(handler) = &self.handler else {
            error!("no handler configured, closing connection");
            return (Reply::error(NO_HANDLER), Some(Exit::NoHandler));
        };

        let mut request = Request::new(command, &mut self.context);
        match handler.handle(&mut request) {
            Ok(reply) => (reply, None),
            Err(HandlerError::Halt) => (Reply::error(HALTED), Some(Exit::Halted)),
            Err(err @ HandlerError::NotFound(_)) => {
                warn!(cause = %err, "unhandled command");
                (Reply::error(INTERNAL_ERROR), None)
            }
            Err(err) => {
                error!(cause = %err, command = %request.command(), "handler failed");
                (Reply::error(INTERNAL_ERROR), None)
            }
        }
    }
}
