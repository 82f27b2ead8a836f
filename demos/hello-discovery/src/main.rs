//! Hello World example for Beacon service discovery.
//!
//! Run one or more servers, each registering itself under a lease:
//!
//! ```text
//! hello-discovery server --port 1701
//! hello-discovery server --port 1702
//! ```
//!
//! Then a client that resolves the service and greets every live instance
//! in turn, following servers as they come and go:
//!
//! ```text
//! hello-discovery client
//! ```
//!
//! Use `--backend consul --store 127.0.0.1:8500` to run against Consul.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beacon::{
    shutdown_signal, AddressSet, Connect, ConsulBackend, EtcdBackend, Lease, Registrar, Resolver,
    ServiceInstance,
};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hello-discovery")]
#[command(about = "Register a greeter service and resolve it from a client")]
#[command(version)]
struct Cli {
    /// Coordination store family.
    #[arg(long, value_enum, default_value_t = StoreKind::Etcd, env = "BEACON_BACKEND")]
    backend: StoreKind,

    /// Store address; comma-separated endpoints for etcd.
    #[arg(long, default_value = "http://127.0.0.1:2379", env = "BEACON_STORE")]
    store: String,

    /// Service name to register or resolve.
    #[arg(long, default_value = "hello_service")]
    service: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum StoreKind {
    Etcd,
    Consul,
}

#[derive(Subcommand)]
enum Command {
    /// Serve greetings and register this instance.
    Server {
        /// Listening port.
        #[arg(long, default_value_t = 1701)]
        port: u16,

        /// Host published to the store.
        #[arg(long, default_value = "127.0.0.1")]
        advertise: String,

        /// Lease time-to-live.
        #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
        ttl: Duration,

        /// Heartbeat interval.
        #[arg(long, default_value = "3s", value_parser = humantime::parse_duration)]
        refresh: Duration,
    },
    /// Greet the resolved instances round-robin.
    Client {
        /// Pause between greetings.
        #[arg(long, default_value = "2s", value_parser = humantime::parse_duration)]
        every: Duration,
    },
}

/// Greeter service.
struct Greeter {
    count: AtomicU64,
}

impl Greeter {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
        }
    }

    fn greet(&self, name: &str) -> String {
        let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if name.is_empty() {
            format!("Hello, stranger! (#{n})")
        } else {
            format!("Hello, {name}! (#{n})")
        }
    }
}

async fn handle(greeter: Arc<Greeter>, stream: TcpStream) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let reply = greeter.greet(line.trim());
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    Ok(())
}

async fn serve(listener: TcpListener) -> std::io::Result<()> {
    let greeter = Arc::new(Greeter::new());
    loop {
        let (stream, peer) = listener.accept().await?;
        let greeter = greeter.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(greeter, stream).await {
                warn!(peer = %peer, error = %e, "connection failed");
            }
        });
    }
}

async fn run_server<B: Connect>(
    cli: &Cli,
    port: u16,
    advertise: &str,
    lease: Lease,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;

    let registrar = Registrar::<B>::connect(&cli.store, lease)?;
    let instance = ServiceInstance::new(&cli.service, advertise, port)?;
    let registration = registrar.start(instance).await?;
    info!(port, "serving greetings");

    let done = registration.deregister_on(shutdown_signal());
    tokio::select! {
        result = serve(listener) => result?,
        result = done => result??,
    }

    info!("server stopped");
    Ok(())
}

async fn greet(addr: &str) -> std::io::Result<String> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(b"world\n").await?;

    let mut reply = String::new();
    BufReader::new(reader).read_line(&mut reply).await?;
    Ok(reply.trim_end().to_string())
}

/// Address to greet on the given round-robin turn.
fn pick(addrs: &AddressSet, turn: usize) -> Option<String> {
    if addrs.is_empty() {
        return None;
    }
    addrs.iter().nth(turn % addrs.len()).map(str::to_string)
}

async fn run_client<B: Connect>(cli: &Cli, every: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let mut watcher = Resolver::new(&cli.service).resolve::<B>(&cli.store)?;
    let addrs = Arc::new(RwLock::new(AddressSet::new()));

    let mirror = addrs.clone();
    tokio::spawn(async move {
        loop {
            let updates = watcher.next().await;
            for update in &updates {
                info!(%update, "address update");
            }
            mirror.write().await.apply(&updates);
        }
    });

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut ticker = tokio::time::interval(every);
    let mut turn = 0usize;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = &mut shutdown => break,
        }

        turn = turn.wrapping_add(1);
        let Some(addr) = pick(&*addrs.read().await, turn) else {
            warn!(service = %cli.service, "no instances available");
            continue;
        };

        match greet(&addr).await {
            Ok(reply) => info!(%addr, "reply is {reply}"),
            Err(e) => error!(%addr, error = %e, "greeting failed"),
        }
    }

    info!("client stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Server {
            port,
            advertise,
            ttl,
            refresh,
        } => {
            let lease = Lease::new(*ttl, *refresh)?;
            match cli.backend {
                StoreKind::Etcd => run_server::<EtcdBackend>(&cli, *port, advertise, lease).await,
                StoreKind::Consul => {
                    run_server::<ConsulBackend>(&cli, *port, advertise, lease).await
                }
            }
        }
        Command::Client { every } => match cli.backend {
            StoreKind::Etcd => run_client::<EtcdBackend>(&cli, *every).await,
            StoreKind::Consul => run_client::<ConsulBackend>(&cli, *every).await,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durations_accept_humantime() {
        let cli = Cli::try_parse_from([
            "hello-discovery",
            "server",
            "--ttl",
            "2500ms",
            "--refresh",
            "1s",
        ])
        .unwrap();
        match cli.command {
            Command::Server { ttl, refresh, .. } => {
                assert_eq!(ttl, Duration::from_millis(2500));
                assert_eq!(refresh, Duration::from_secs(1));
                assert!(Lease::new(ttl, refresh).is_ok());
            }
            Command::Client { .. } => panic!("expected server command"),
        }

        let cli = Cli::try_parse_from(["hello-discovery", "client", "--every", "1m"]).unwrap();
        assert!(matches!(cli.command, Command::Client { every } if every == Duration::from_secs(60)));
    }

    #[test]
    fn test_pick_round_robin() {
        assert_eq!(pick(&AddressSet::new(), 3), None);

        let addrs: AddressSet = ["10.0.0.1:1701", "10.0.0.2:1701"].into_iter().collect();
        assert_eq!(pick(&addrs, 1).as_deref(), Some("10.0.0.2:1701"));
        assert_eq!(pick(&addrs, 2).as_deref(), Some("10.0.0.1:1701"));
    }
}
