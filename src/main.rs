use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use edge_cdn::prelude::*;
use log::{error, info};

/// Self-organizing CDN edge node. Without `--upstream` the node is the
/// master, otherwise it is a peer logging in to the master at `upstream`
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Origin base URL, required on the master
    #[clap(long)]
    mirror: Option<String>,

    /// Durable log of the peers' reports, `-` for stdout
    #[clap(long = "log")]
    log_file: Option<PathBuf>,

    /// Master control endpoint, `host:port`
    #[clap(long)]
    upstream: Option<String>,

    /// HTTP listen address
    #[clap(long, default_value = "0.0.0.0:5000")]
    addr: String,

    /// Control channel listen address, master only
    #[clap(long, default_value = "0.0.0.0:5001")]
    control_addr: String,

    /// Shared membership token
    #[clap(long, default_value = "")]
    token: String,

    /// Virtual nodes per peer on the hash ring
    #[clap(long, default_value_t = 3)]
    replicas: usize,

    /// Cache budget in MiB
    #[clap(long, default_value_t = 512)]
    cache_mb: usize,

    /// Master redirect policy, `consistent_hash` or `random`
    #[clap(long, default_value = "consistent_hash")]
    redirect: RedirectPolicy,
}

fn config(args: Args) -> Result<NodeConfig, ConfigError> {
    let mut builder = NodeConfigBuilder::default();
    builder
        .address(args.addr)
        .control_address(args.control_addr)
        .token(args.token)
        .replicas(args.replicas)
        .cache_bytes(cache_bytes_from_mib(args.cache_mb)?)
        .redirect_policy(args.redirect);
    if let Some(mirror) = args.mirror {
        builder.mirror(mirror);
    }
    if let Some(upstream) = args.upstream {
        builder.upstream(upstream);
    }
    if let Some(log_file) = args.log_file {
        builder.log_file(log_file);
    }
    Ok(builder.build()?)
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let server = match config(args).map_err(ServerError::from).and_then(Server::new) {
        Ok(server) => server,
        Err(err) => {
            error!(error:? = err; "Invalid configuration");
            exit(2);
        }
    };
    let listeners = match server.bind().await {
        Ok(listeners) => listeners,
        Err(err) => {
            error!(error:? = err; "Could not bind");
            exit(1);
        }
    };

    let state = server.app_data().state.clone();
    tokio::select! {
        result = server.run(listeners) => {
            if let Err(err) = result {
                error!(error:? = err; "Server failed");
                exit(1);
            }
        }
        outcome = wait_for_signals(state) => {
            match outcome {
                Ok(CloseOutcome::Drained) => {
                    info!("Closed");
                    exit(0);
                }
                Ok(CloseOutcome::Abort) => exit(1),
                Err(err) => {
                    error!(error:% = err; "Signal handling failed");
                    exit(1);
                }
            }
        }
    }
}
