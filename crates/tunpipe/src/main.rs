//! tunpipe — tunnel link-layer frames over an arbitrary transport.
//!
//! One instance runs on each host: frames captured from the local
//! endpoint (pppd, TUN/TAP, stdio) are carried over the chosen
//! transport (UDP, HTTP, XMPP) and replayed on the peer's endpoint.
//!
//! Typical PPP-over-UDP setup (run on both hosts, `-s` on one):
//!
//! ```text
//!   tunpipe -s udp.port=5000 udp.host=192.168.1.2
//!   tunpipe    udp.port=5000 udp.host=192.168.1.1
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tunpipe_core::iface::pppd::PppdInterface;
use tunpipe_core::iface::stdio::StdioInterface;
use tunpipe_core::iface::tun::TunInterface;
use tunpipe_core::transport::http::HttpTransport;
use tunpipe_core::transport::udp::UdpTransport;
#[cfg(feature = "xmpp")]
use tunpipe_core::transport::xmpp::XmppTransport;
use tunpipe_core::{Config, Module, ModuleKind, PacketPool, Pipeline};

/// Tunnel link-layer frames over UDP, HTTP or XMPP.
#[derive(Parser, Debug)]
#[command(name = "tunpipe", about = "Tunnel link-layer frames over UDP, HTTP or XMPP")]
struct Cli {
    /// Read configuration from the file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Interface module.
    #[arg(short, long, value_name = "NAME")]
    interface: Option<String>,

    /// Transport module.
    #[arg(short, long, value_name = "NAME")]
    transport: Option<String>,

    /// Server side.
    #[arg(short, long)]
    server: bool,

    /// Print list of supported modules.
    #[arg(short, long)]
    list: bool,

    /// Print debug messages.
    #[arg(short, long)]
    verbose: bool,

    /// Additional configuration records, e.g. `udp.port=5000`.
    #[arg(value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

// ─── Module registry ────────────────────────────────────────────────────────

type Factory = fn(&Config, Arc<PacketPool>) -> tunpipe_core::Result<Arc<dyn Module>>;

struct ModuleEntry {
    name: &'static str,
    descr: &'static str,
    kind: ModuleKind,
    factory: Factory,
}

fn new_stdio(conf: &Config, pool: Arc<PacketPool>) -> tunpipe_core::Result<Arc<dyn Module>> {
    Ok(Arc::new(StdioInterface::new(conf, pool)?))
}

fn new_pppd(conf: &Config, pool: Arc<PacketPool>) -> tunpipe_core::Result<Arc<dyn Module>> {
    Ok(Arc::new(PppdInterface::new(conf, pool)?))
}

fn new_tun(conf: &Config, pool: Arc<PacketPool>) -> tunpipe_core::Result<Arc<dyn Module>> {
    Ok(Arc::new(TunInterface::tun(conf, pool)?))
}

fn new_tap(conf: &Config, pool: Arc<PacketPool>) -> tunpipe_core::Result<Arc<dyn Module>> {
    Ok(Arc::new(TunInterface::tap(conf, pool)?))
}

fn new_udp(conf: &Config, pool: Arc<PacketPool>) -> tunpipe_core::Result<Arc<dyn Module>> {
    Ok(Arc::new(UdpTransport::new(conf, pool)?))
}

fn new_http(conf: &Config, pool: Arc<PacketPool>) -> tunpipe_core::Result<Arc<dyn Module>> {
    Ok(Arc::new(HttpTransport::new(conf, pool)?))
}

#[cfg(feature = "xmpp")]
fn new_xmpp(conf: &Config, pool: Arc<PacketPool>) -> tunpipe_core::Result<Arc<dyn Module>> {
    Ok(Arc::new(XmppTransport::new(conf, pool)?))
}

const MODULES: &[ModuleEntry] = &[
    ModuleEntry {
        name: "stdio",
        descr: "Standard in/out interface",
        kind: ModuleKind::Interface,
        factory: new_stdio,
    },
    ModuleEntry {
        name: "pppd",
        descr: "PPP interface via pppd",
        kind: ModuleKind::Interface,
        factory: new_pppd,
    },
    ModuleEntry {
        name: "tun",
        descr: "TUN interface",
        kind: ModuleKind::Interface,
        factory: new_tun,
    },
    ModuleEntry {
        name: "tap",
        descr: "TAP interface",
        kind: ModuleKind::Interface,
        factory: new_tap,
    },
    ModuleEntry {
        name: "udp",
        descr: "UDP transport",
        kind: ModuleKind::Transport,
        factory: new_udp,
    },
    ModuleEntry {
        name: "http",
        descr: "HTTP transport",
        kind: ModuleKind::Transport,
        factory: new_http,
    },
    #[cfg(feature = "xmpp")]
    ModuleEntry {
        name: "xmpp",
        descr: "XMPP transport",
        kind: ModuleKind::Transport,
        factory: new_xmpp,
    },
];

fn print_module_list() {
    for (kind, title) in [
        (ModuleKind::Interface, "Interface modules"),
        (ModuleKind::Transport, "Transport modules"),
    ] {
        println!("{title}:");
        for entry in MODULES.iter().filter(|e| e.kind == kind) {
            println!("  {:<8}{}", entry.name, entry.descr);
        }
    }
}

fn build_module(
    conf: &Config,
    pool: Arc<PacketPool>,
    name: &str,
    kind: ModuleKind,
) -> anyhow::Result<Arc<dyn Module>> {
    let entry = MODULES
        .iter()
        .find(|e| e.name == name && e.kind == kind)
        .with_context(|| format!("unknown {kind:?} module '{name}' (see --list)"))?;
    (entry.factory)(conf, pool).with_context(|| format!("initialising module '{name}'"))
}

// ─── Config assembly ────────────────────────────────────────────────────────

/// Fill the store from the command line, then from the config file.
/// Argv keys take precedence: the file source skips existing keys.
fn assemble_config(cli: &Cli) -> anyhow::Result<Config> {
    let conf = Config::new();
    if let Some(path) = &cli.config {
        conf.store("config", &path.to_string_lossy());
    }
    if let Some(interface) = &cli.interface {
        conf.store("interface", interface);
    }
    if let Some(transport) = &cli.transport {
        conf.store("transport", transport);
    }
    if cli.server {
        conf.store("server", "1");
    }
    if cli.verbose {
        conf.store("verbose", "1");
    }
    if cli.list {
        conf.store("list", "1");
    }
    for record in &cli.overrides {
        if record.starts_with('-') {
            bail!("unrecognised option '{record}'");
        }
        let (key, val) = record.split_once('=').unwrap_or((record.as_str(), "1"));
        conf.store(key, val);
    }
    if let Some(path) = &cli.config {
        conf.read_file(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
    }
    Ok(conf)
}

// ─── Main ───────────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // Dead peers must surface as I/O errors, not process death.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    if cli.list {
        print_module_list();
        return Ok(());
    }

    let conf = assemble_config(&cli)?;
    if conf.find_bool("server") {
        // Default tunnel addresses for the server side.
        conf.store_if_absent("pppd.ip", "10.0.0.1:10.0.0.2");
    }

    let iface_name = conf.find_str("interface").unwrap_or_else(|| "pppd".into());
    let transport_name = conf.find_str("transport").unwrap_or_else(|| "udp".into());
    tracing::info!(
        interface = %iface_name,
        transport = %transport_name,
        server = conf.find_bool("server"),
        "tunpipe starting"
    );

    let pool = Arc::new(PacketPool::new());
    let mut pipeline = Pipeline::new(pool.clone());
    pipeline.add_module(build_module(
        &conf,
        pool.clone(),
        &iface_name,
        ModuleKind::Interface,
    )?);
    pipeline.add_module(build_module(
        &conf,
        pool.clone(),
        &transport_name,
        ModuleKind::Transport,
    )?);

    // SIGINT/SIGTERM request shutdown; the handler posts to a channel
    // the main thread blocks on.
    let (signal_tx, signal_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = signal_tx.try_send(());
    })
    .context("installing signal handler")?;

    pipeline.start().context("starting pipeline")?;
    tracing::info!("pipeline running");

    let _ = signal_rx.recv();
    tracing::info!("signal caught, shutting down");

    pipeline.stop();
    tracing::info!("tunpipe stopped");
    Ok(())
}
