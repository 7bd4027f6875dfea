use anyhow::{Context, Result};
use clap::Parser;
use holepunch::nat_traversal::{NatTraversal, PunchConfig, DEFAULT_STUN_SERVER};
use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "holepunch")]
#[command(version)]
#[command(about = "Open a direct QUIC session with a peer behind NAT and exchange one message")]
struct Args {
    /// The message to send the other peer
    #[arg(short, long)]
    msg: String,

    /// STUN server used to learn our external address
    #[arg(long, env = "STUN_SERVER", default_value = DEFAULT_STUN_SERVER)]
    stun_server: String,

    /// Local UDP address to bind (port 0 picks a random port)
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Seconds to wait for the dial/listen race per peer
    #[arg(long, default_value_t = 20)]
    timeout_secs: u64,

    /// Outbound handshake attempts per peer
    #[arg(long, default_value_t = 10)]
    dial_attempts: u32,

    /// Milliseconds between outbound handshake attempts
    #[arg(long, default_value_t = 200)]
    retry_delay_ms: u64,
}

impl Args {
    fn into_config(self) -> (String, PunchConfig) {
        let config = PunchConfig {
            stun_server: self.stun_server,
            bind_addr: self.bind,
            punch_timeout: Duration::from_secs(self.timeout_secs),
            dial_attempts: self.dial_attempts,
            dial_retry_delay: Duration::from_millis(self.retry_delay_ms),
            ..PunchConfig::default()
        };
        (self.msg, config)
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.msg.is_empty() {
        log::error!("You must provide a message for the other peer");
        std::process::exit(1);
    }

    let (msg, config) = args.into_config();
    if let Err(e) = run(msg, config).await {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(msg: String, config: PunchConfig) -> Result<()> {
    let mut nat = NatTraversal::start(config).await?;

    // print local address to observe basic info about NAT
    println!("Local address: {}", nat.local_addr());
    println!("Your address is: {}", nat.external_addr());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("Enter remote peer address (with port): ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await.context("Failed to read peer address")? else {
            println!();
            break;
        };
        let target = line.trim_matches(|c: char| c.is_whitespace());
        if target.is_empty() {
            continue;
        }

        println!("Connecting to peer...");
        let canonical = match nat.connect(target).await {
            Ok(canonical) => canonical,
            Err(e) => {
                log::error!("Hole punch to {} failed: {}", target, e);
                nat.reset();
                continue;
            }
        };
        println!("Session established with {}", canonical.session.remote_address());

        match nat.exchange(canonical, msg.as_bytes()).await {
            Ok(reply) => println!("Got message from peer: {}", String::from_utf8_lossy(&reply)),
            Err(e) => log::error!("Message exchange with {} failed: {}", target, e),
        }
        nat.reset();
    }

    nat.shutdown();
    Ok(())
}
