mod http;
mod miner;
mod node;
mod p2p;

use anyhow::{Context, Result};
use argh::FromArgs;
use log::{error, warn};

use ember_core::wallet::Wallet;

use crate::node::Node;

#[derive(FromArgs)]
/// A minimal proof-of-work cryptocurrency node
struct Args {
    /// admin http port
    #[argh(option, default = "8080")]
    port: u16,

    /// p2p listen port
    #[argh(option, default = "6161")]
    p2p_port: u16,

    /// wallet key file location
    #[argh(option, default = "String::from(\"./private.key\")")]
    key_file: String,

    /// addresses of initial peers (host:port)
    #[argh(positional)]
    peers: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Args = argh::from_env();

    // key I/O is the one fatal failure of the process
    let wallet = Wallet::load_or_create(&args.key_file)
        .with_context(|| format!("failed to initialize wallet from {}", args.key_file))?;
    println!("Your address: {}", wallet.address());

    let node = Node::new(wallet);

    {
        let node = node.clone();
        let p2p_port = args.p2p_port;
        tokio::spawn(async move {
            if let Err(e) = p2p::serve(node, p2p_port).await {
                error!("p2p listener failed: {:#}", e);
            }
        });
    }

    for peer in &args.peers {
        if let Err(e) = p2p::connect(node.clone(), peer).await {
            warn!("could not reach initial peer {}: {:#}", peer, e);
        }
    }

    http::serve(node, args.port).await
}
