use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use deproxy_rs::deproxy::selfproxy::{Chunking, SelfProxy};
use deproxy_rs::deproxy::H2Input;
use deproxy_rs::message::Response;
use deproxy_rs::{Config, DeproxyClient, DeproxyClientH2, DeproxyManager, StaticDeproxyServer, Stateful};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "deproxy-rs")]
#[command(about = "Emulated HTTP clients and servers for testing reverse proxies")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer every request with one static response
    Serve {
        #[arg(short, long, default_value = "127.0.0.1:8000")]
        listen: SocketAddr,

        /// File holding the full response
        #[arg(long, conflicts_with = "body")]
        response: Option<String>,

        /// Body of a generated 200 response
        #[arg(long)]
        body: Option<String>,

        #[arg(long, default_value = "200")]
        status: u16,
    },
    /// Relay TCP connections, cutting the forwarded stream into segments
    Relay {
        #[arg(short, long)]
        listen: SocketAddr,

        #[arg(short, long)]
        forward: SocketAddr,

        #[arg(long, default_value = "0")]
        segment_size: usize,

        /// Milliseconds between segments
        #[arg(long, default_value = "0")]
        segment_gap: u64,
    },
    /// Send one request and print the response
    Send {
        target: SocketAddr,

        #[arg(short, long, default_value = "GET")]
        method: String,

        #[arg(short, long, default_value = "/")]
        uri: String,

        /// `name: value`, repeatable
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        #[arg(short, long)]
        body: Option<String>,

        #[arg(long)]
        http2: bool,
    },
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let Some((name, value)) = raw.split_once(':') else {
        bail!("header {:?} is not `name: value`", raw);
    };
    Ok((name.trim().to_string(), value.trim().to_string()))
}

fn static_response(response: Option<String>, body: Option<String>, status: u16) -> Result<Vec<u8>> {
    if let Some(path) = response {
        let path = Config::expand_path(&path);
        return std::fs::read(&path).with_context(|| format!("reading response from {}", path));
    }
    let body = body.unwrap_or_default();
    Ok(Response::create(status)
        .header("Content-Length", &body.len().to_string())
        .date_now()
        .server("deproxy")
        .body(body)
        .to_bytes()
        .to_vec())
}

async fn wait_for_ctrl_c() -> Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutting down");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")?;

    let config = match &cli.config {
        Some(path) => Config::from_file(Config::expand_path(path))?,
        None => Config::default(),
    };
    let timeout = config.default_timeout();
    let mut manager = DeproxyManager::new(config);
    manager.start()?;
    let handle = manager.handle();

    match cli.command {
        Command::Serve {
            listen,
            response,
            body,
            status,
        } => {
            let response = static_response(response, body, status)?;
            let mut server = StaticDeproxyServer::with_response(&handle, listen, response);
            server.start()?;
            info!("Serving on {}", server.addr());
            wait_for_ctrl_c().await?;
            server.stop();
        }
        Command::Relay {
            listen,
            forward,
            segment_size,
            segment_gap,
        } => {
            let chunking = Chunking {
                segment_size,
                segment_gap: Duration::from_millis(segment_gap),
            };
            let mut relay = SelfProxy::new(&handle, listen, forward, chunking);
            relay.start()?;
            info!("Relaying {} -> {} with {:?}", relay.addr(), forward, chunking);
            wait_for_ctrl_c().await?;
            relay.stop();
        }
        Command::Send {
            target,
            method,
            uri,
            headers,
            body,
            http2,
        } => {
            let headers = headers.iter().map(|h| parse_header(h)).collect::<Result<Vec<_>>>()?;
            let response = if http2 {
                let mut client = DeproxyClientH2::new(&handle, target);
                let request = client
                    .create_request(&method)
                    .uri(&uri)
                    .headers(headers)
                    .body(body.unwrap_or_default())
                    .build()?;
                client.start()?;
                client.send_request(H2Input::from(request), None, timeout).await?;
                let response = client.last_response();
                client.stop();
                response
            } else {
                let mut client = DeproxyClient::new(&handle, target);
                let request = client
                    .create_request(&method)
                    .uri(&uri)
                    .headers(headers)
                    .body(body.unwrap_or_default())
                    .build()?;
                client.start()?;
                client.send_request(request, None, timeout).await?;
                let response = client.last_response();
                client.stop();
                response
            };
            match response {
                Some(response) => println!("{}", response),
                None => bail!("no response from {} within {:?}", target, timeout),
            }
        }
    }

    manager.check_errors()?;
    manager.stop();
    Ok(())
}
