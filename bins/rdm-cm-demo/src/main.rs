use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::task::JoinHandle;

use rdm_cm::{CmConfig, CmContext, ConnState, Endpoint};
use rdm_logging::LogConfig;
use rdm_types::PeerAddress;
use rdm_verbs::sim::SimFabric;

/// Drive RDM connection setup on a simulated fabric.
#[derive(Parser, Debug)]
#[command(name = "rdm-cm-demo", version, about)]
struct Args {
    /// Which connection pattern to run.
    #[arg(long, value_enum, default_value_t = Scenario::Connect)]
    scenario: Scenario,

    /// CM configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Give up waiting for a state after this long.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Log level filter; RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Scenario {
    /// a1 connects to a2.
    Connect,
    /// a1 and a2 connect to each other at the same time.
    Mutual,
    /// a1 connects to itself.
    Loopback,
}

struct Node {
    ctx: Arc<CmContext>,
    ep: Arc<Endpoint>,
}

impl Node {
    fn open(fabric: &SimFabric, name: &str, address: PeerAddress, config: &CmConfig) -> anyhow::Result<Self> {
        let ctx = Arc::new(CmContext::new(fabric.device(name), config.clone())?);
        let ep = ctx.open_endpoint(address, None)?;
        Ok(Self { ctx, ep })
    }

    fn state(&self, peer: &PeerAddress) -> Option<ConnState> {
        self.ctx
            .connection(self.ep.id(), peer)
            .map(|conn| conn.lock().state())
    }
}

/// Run `progress` on a blocking task until `stop` is set.
fn spawn_progress(ctx: Arc<CmContext>, stop: Arc<AtomicBool>) -> JoinHandle<usize> {
    tokio::task::spawn_blocking(move || {
        let mut handled = 0;
        while !stop.load(Ordering::Acquire) {
            match ctx.progress() {
                Ok(n) => handled += n,
                Err(e) => tracing::warn!(error = %e, "progress reported an error"),
            }
        }
        handled
    })
}

async fn wait_for(
    what: &str,
    timeout: Duration,
    mut done: impl FnMut() -> bool,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !done() {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tracing::info!("{} reached", what);
    Ok(())
}

fn report(node: &Node, peer: &PeerAddress) {
    match node.ctx.connection(node.ep.id(), peer) {
        Some(conn) => {
            let conn = conn.lock();
            println!(
                "{} -> {}: role={:?} state={:?} preposted={} active={}",
                node.ep.address(),
                peer,
                conn.role(),
                conn.state(),
                conn.recv_preposted(),
                node.ep.active_connections()
            );
        }
        None => println!("{} -> {}: no connection", node.ep.address(), peer),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_config = LogConfig {
        level: args.log_level.clone(),
        json_format: args.json,
        thread_names: true,
        ..Default::default()
    };
    let _guard = rdm_logging::init_logging(&log_config)?;

    let config = match &args.config {
        Some(path) => CmConfig::load(path)?,
        None => CmConfig::default(),
    };
    let timeout = Duration::from_millis(args.timeout_ms);

    let a1 = PeerAddress::from_octets(10, 0, 0, 1, 7471);
    let a2 = PeerAddress::from_octets(10, 0, 0, 2, 7471);
    let fabric = SimFabric::new();

    let n1 = Node::open(&fabric, "sim0", a1, &config)?;
    let n2 = match args.scenario {
        Scenario::Loopback => None,
        _ => Some(Node::open(&fabric, "sim1", a2, &config)?),
    };
    // (node, peer) pairs expected to reach ESTABLISHED.
    let mut pairs: Vec<(&Node, PeerAddress)> = Vec::new();
    match (&n2, args.scenario) {
        (Some(n2), Scenario::Connect | Scenario::Mutual) => {
            pairs.push((&n1, a2));
            pairs.push((n2, a1));
        }
        _ => pairs.push((&n1, a1)),
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut loops = vec![spawn_progress(Arc::clone(&n1.ctx), Arc::clone(&stop))];
    if let Some(n2) = &n2 {
        loops.push(spawn_progress(Arc::clone(&n2.ctx), Arc::clone(&stop)));
    }

    tracing::info!(scenario = ?args.scenario, "starting");
    match (&n2, args.scenario) {
        (Some(n2), Scenario::Mutual) => {
            n1.ctx.connect(n1.ep.id(), a2)?;
            n2.ctx.connect(n2.ep.id(), a1)?;
        }
        (Some(_), _) => {
            n1.ctx.connect(n1.ep.id(), a2)?;
        }
        (None, _) => {
            n1.ctx.connect(n1.ep.id(), a1)?;
        }
    }

    let established = wait_for("established", timeout, || {
        pairs
            .iter()
            .all(|(node, peer)| node.state(peer) == Some(ConnState::Established))
    })
    .await;
    for (node, peer) in &pairs {
        report(node, peer);
    }

    let result = match established {
        Ok(()) => {
            let (node, peer) = pairs[0];
            node.ctx.disconnect(node.ep.id(), peer)?;
            let closed = wait_for("closed", timeout, || {
                pairs
                    .iter()
                    .all(|(node, peer)| node.state(peer) == Some(ConnState::Closed))
            })
            .await;
            for (node, peer) in &pairs {
                report(node, peer);
            }
            closed
        }
        Err(e) => Err(e),
    };

    stop.store(true, Ordering::Release);
    for handle in loops {
        let handled = handle.await?;
        tracing::debug!(handled, "progress loop finished");
    }
    n1.ctx.close_endpoint(n1.ep.id())?;
    if let Some(n2) = &n2 {
        n2.ctx.close_endpoint(n2.ep.id())?;
    }
    println!(
        "fabric: channels={} qps={} regions={}",
        fabric.live_channels(),
        fabric.live_qps(),
        fabric.registered_regions()
    );
    result
}
