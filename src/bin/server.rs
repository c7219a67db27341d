use std::time::{Duration, Instant};

use beam::handler::{middleware_fn, Handler, HandlerChain, Router};
use beam::{config, Config, Error, HandlerError, Reply, Request, Server};
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "A RESP server answering PING, ECHO and QUIT")]
struct Args {
    /// The port to listen on
    #[arg(short, long, env = "BEAM_PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// The interface to bind
    #[arg(short, long, env = "BEAM_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Deadline for a single socket read or write, in milliseconds
    #[arg(long, env = "BEAM_RW_TIMEOUT_MS", default_value_t = 5_000)]
    rw_timeout_ms: u64,

    /// Close connections idle for this many seconds
    #[arg(long, env = "BEAM_IDLE_TIMEOUT_SECS", default_value_t = 300)]
    idle_timeout_secs: u64,

    /// Per-connection read buffer size, which is also the largest accepted command
    #[arg(long, env = "BEAM_BUFFER_SIZE", default_value_t = config::DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,
}

impl From<Args> for Config {
    fn from(args: Args) -> Config {
        Config::new(format!("{}:{}", args.bind, args.port))
            .with_rw_timeout(Duration::from_millis(args.rw_timeout_ms))
            .with_idle_timeout(Duration::from_secs(args.idle_timeout_secs))
            .with_buffer_size(args.buffer_size)
    }
}

fn handler() -> impl Handler {
    let router = Router::new()
        .route_fn("PING", |req| match req.get(1) {
            Some(message) => Ok(Reply::bulk(message)),
            None => Ok(Reply::simple("PONG")),
        })
        .route_fn("ECHO", |req| match req.args() {
            [message] => Ok(Reply::bulk(message)),
            _ => Ok(Reply::error(
                "ERR wrong number of arguments for 'echo' command",
            )),
        })
        .route_fn("QUIT", |_| Err(HandlerError::Halt));

    HandlerChain::builder(router)
        .middleware(middleware_fn(|req: &mut Request<'_>, next: &dyn Handler| {
            let start = Instant::now();
            let result = next.handle(req);
            debug!(command = %req.command(), elapsed = ?start.elapsed(), "handled");

            match result {
                Err(HandlerError::NotFound(name)) => Ok(Reply::error(format!(
                    "ERR unknown command '{}'",
                    name
                ))),
                result => result,
            }
        }))
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init()
        .map_err(|e| eprintln!("Failed to initialize global tracing: {}", e));

    let config = Config::from(Args::parse());
    let server = Server::with_handler(config, handler());

    let mut serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve().await })
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                error!(cause = %err, "failed to listen for the shutdown signal");
            }
            info!("shutting down");
        }
        res = &mut serving => {
            // The accept loop only returns on its own after a fatal error.
            return res?;
        }
    }

    server.shutdown().await;
    serving.await??;
    info!("all connections closed");

    Ok(())
}
