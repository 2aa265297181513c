//! Mesh Node Command-Line Interface
//!
//! This CLI provides tools for:
//! - Simulating a multi-node mesh with reliable delivery
//! - Creating and inspecting persisted device state
//! - Estimating airtime and retransmission timing per modem preset
//! - Running a pair of live nodes on the system clock

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use meshnode_core::clock::{Clock, SystemClock};
use meshnode_core::config::MeshConfig;
use meshnode_core::mesh::simulation::{SimConfig, SimNetwork, SimRadio, Topology};
use meshnode_core::mesh::{
    AirtimeModel, AppMessage, MeshPacket, MeshService, ModemPreset, NodeNum,
};
use meshnode_core::persistence::{load_device_state, FileStorage, LoadOutcome, MemoryStorage};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "meshnode")]
#[command(author, version, about = "Mesh node database and reliable router CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Mesh configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a mesh of nodes exchanging reliable messages
    Simulate {
        /// Number of nodes
        #[arg(short, long, default_value = "5")]
        nodes: usize,

        /// Topology (chain, star, mesh). Only broadcasts are relayed, so
        /// direct messages need a link to the last node.
        #[arg(short, long, default_value = "mesh")]
        topology: String,

        /// Per-link frame loss probability (0.0-1.0)
        #[arg(short, long, default_value = "0.0")]
        loss: f64,

        /// Number of messages to send from random nodes
        #[arg(short, long, default_value = "3")]
        messages: usize,

        /// Broadcast instead of addressing the last node
        #[arg(long)]
        broadcast: bool,

        /// RNG seed (random if not given)
        #[arg(long)]
        seed: Option<u64>,

        /// Maximum simulation steps per message
        #[arg(long, default_value = "2000")]
        max_steps: u64,
    },

    /// Device state commands
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },

    /// Show airtime and retransmission timing per modem preset
    Airtime {
        /// Packet payload length in bytes
        #[arg(short, long, default_value = "32")]
        len: usize,

        /// Only show this preset (e.g. LongFast, short-slow)
        #[arg(short, long)]
        preset: Option<String>,
    },

    /// Run two nodes on the system clock and exchange messages
    Run {
        /// How long to run, in seconds
        #[arg(short, long, default_value = "30")]
        duration: u64,

        /// Seconds between messages
        #[arg(short, long, default_value = "5")]
        interval: u64,

        /// Per-frame loss probability (0.0-1.0)
        #[arg(short, long, default_value = "0.0")]
        loss: f64,
    },
}

#[derive(Subcommand)]
enum DbCommand {
    /// Boot a node once and write its device state
    Init {
        /// State file (defaults to the configured state path)
        #[arg(short, long)]
        state: Option<PathBuf>,

        /// MAC address (e.g., "24:0a:c4:12:34:56")
        #[arg(short, long)]
        mac: Option<String>,

        /// Long name for the owner
        #[arg(long)]
        owner: Option<String>,
    },

    /// Show the node database stored in a state file
    Show {
        /// State file (defaults to the configured state path)
        #[arg(short, long)]
        state: Option<PathBuf>,

        /// Print the raw device state as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => MeshConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => MeshConfig::default(),
    };

    match cli.command {
        Commands::Simulate {
            nodes,
            topology,
            loss,
            messages,
            broadcast,
            seed,
            max_steps,
        } => cmd_simulate(config, nodes, topology, loss, messages, broadcast, seed, max_steps),

        Commands::Db { command } => match command {
            DbCommand::Init { state, mac, owner } => cmd_db_init(config, state, mac, owner),
            DbCommand::Show { state, json } => cmd_db_show(config, state, json),
        },

        Commands::Airtime { len, preset } => cmd_airtime(len, preset),

        Commands::Run {
            duration,
            interval,
            loss,
        } => cmd_run(config, duration, interval, loss),
    }
}

fn parse_topology(name: &str) -> Result<Topology> {
    match name.to_lowercase().as_str() {
        "chain" | "line" => Ok(Topology::Chain),
        "star" => Ok(Topology::Star),
        "mesh" | "full" | "fullmesh" => Ok(Topology::FullMesh),
        _ => bail!("Unknown topology: {}. Use chain, star or mesh", name),
    }
}

fn parse_preset(name: &str) -> Result<ModemPreset> {
    ModemPreset::from_name(name).with_context(|| {
        let names: Vec<String> = ModemPreset::ALL.iter().map(|p| format!("{:?}", p)).collect();
        format!("Unknown preset: {}. Use one of {}", name, names.join(", "))
    })
}

/// Parse a MAC address written as "aa:bb:cc:dd:ee:ff" or "aabbccddeeff"
fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let hex: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
    if hex.len() != 12 || !hex.is_ascii() {
        bail!("MAC address must have 6 bytes: {}", s);
    }
    let mut mac = [0u8; 6];
    for (i, byte) in mac.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .with_context(|| format!("Invalid MAC address: {}", s))?;
    }
    Ok(mac)
}

fn random_mac() -> [u8; 6] {
    let mut mac = [0u8; 6];
    rand::thread_rng().fill(&mut mac[..]);
    // Locally administered, unicast
    mac[0] = (mac[0] | 0x02) & 0xfe;
    mac
}

fn state_path(config: &MeshConfig, state: Option<PathBuf>) -> Result<PathBuf> {
    state
        .or_else(|| config.state_path.clone())
        .context("No state file given; pass --state or set state_path in the config")
}

/// One-line description of a delivered packet
fn describe(packet: &MeshPacket) -> String {
    let Some(data) = packet.decoded_data() else {
        return "<encrypted>".to_string();
    };
    match &data.message {
        AppMessage::Text(text) => format!("text \"{}\"", text),
        AppMessage::Routing(routing) if routing.is_ack() => {
            format!("ack for 0x{:08x}", data.request_id)
        }
        AppMessage::Routing(routing) => {
            format!("nak {:?} for 0x{:08x}", routing.error_reason, data.request_id)
        }
        AppMessage::Position(pos) => {
            format!("position {:.5}, {:.5}", pos.latitude(), pos.longitude())
        }
        AppMessage::User(user) => format!("user {} ({})", user.long_name, user.short_name),
        AppMessage::Raw { port, bytes } => format!("{:?} {} bytes", port, bytes.len()),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_simulate(
    config: MeshConfig,
    nodes: usize,
    topology: String,
    loss: f64,
    messages: usize,
    broadcast: bool,
    seed: Option<u64>,
    max_steps: u64,
) -> Result<()> {
    if nodes < 2 {
        bail!("Need at least 2 nodes to simulate");
    }
    let topology = parse_topology(&topology)?;
    let seed = seed.unwrap_or_else(|| rand::thread_rng().gen());

    println!("=== Mesh Simulation ===");
    println!("Nodes: {}", nodes);
    println!("Topology: {:?}", topology);
    println!("Loss rate: {:.1}%", loss * 100.0);
    println!("Seed: {}", seed);
    println!("Preset: {:?}", config.modem_preset);
    println!();

    let sim_config = SimConfig::default()
        .with_node_count(nodes)
        .with_topology(topology)
        .with_loss_rate(loss)
        .with_seed(seed)
        .with_mesh_config(MeshConfig {
            no_save: true,
            ..config
        });
    let mut sim = SimNetwork::new(sim_config);

    let mut rng = rand::thread_rng();
    let last = nodes - 1;
    for n in 0..messages {
        let from = if broadcast { rng.gen_range(0..nodes) } else { rng.gen_range(0..last) };
        let to = (!broadcast).then_some(last);
        let text = format!("message {} from node {}", n + 1, from);

        let id = sim
            .send_text(from, to, &text, true)
            .with_context(|| format!("Node {} failed to send", from))?;
        match to {
            Some(to) => println!(
                "[{}] {} -> {} id=0x{:08x} \"{}\"",
                from,
                sim.node_num(from),
                sim.node_num(to),
                id,
                text
            ),
            None => println!("[{}] {} -> all id=0x{:08x} \"{}\"", from, sim.node_num(from), id, text),
        }

        match sim.run_until_idle(max_steps) {
            Some(steps) => info!(steps, "Network idle"),
            None => warn!(max_steps, "Network still busy"),
        }
    }

    println!();
    for idx in 0..sim.node_count() {
        for packet in sim.inbox(idx) {
            println!(
                "  [{}] {} got from {}: {}",
                idx,
                sim.node_num(idx),
                packet.sender(sim.node_num(idx)),
                describe(packet)
            );
        }
    }

    sim.print_summary();
    Ok(())
}

fn cmd_db_init(
    config: MeshConfig,
    state: Option<PathBuf>,
    mac: Option<String>,
    owner: Option<String>,
) -> Result<()> {
    let path = state_path(&config, state)?;
    let mac = match mac {
        Some(mac) => parse_mac(&mac)?,
        None => random_mac(),
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let radio = SimRadio::new(config.modem_preset, clock.clone());

    let mut node = MeshService::init(
        MeshConfig {
            no_save: false,
            ..config
        },
        radio,
        clock,
        Box::new(FileStorage::new(&path)),
        mac,
    );

    if let Some(long_name) = owner {
        let mut user = node.owner().clone();
        user.long_name = long_name;
        node.set_owner(user).context("Failed to set owner")?;
    }

    if !node.save_to_disk() {
        bail!("Failed to write device state to {}", path.display());
    }

    println!("=== Device State Written ===");
    println!("File: {}", path.display());
    println!("Node: {}", node.node_num());
    println!("Owner: {} ({})", node.owner().long_name, node.owner().short_name);
    println!("Nodes in db: {}", node.node_db().len());
    Ok(())
}

fn cmd_db_show(config: MeshConfig, state: Option<PathBuf>, json: bool) -> Result<()> {
    let path = state_path(&config, state)?;
    let storage = FileStorage::new(&path);

    let state = match load_device_state(&storage) {
        LoadOutcome::Loaded(state) => state,
        LoadOutcome::NotFound => bail!("No device state at {}", path.display()),
        LoadOutcome::Corrupt(e) => {
            return Err(e).with_context(|| format!("Device state at {} is unreadable", path.display()))
        }
        LoadOutcome::TooOld(version) => {
            bail!("Device state at {} has old version {}", path.display(), version)
        }
    };

    if json {
        let text = serde_json::to_string_pretty(&state).context("Failed to encode device state")?;
        println!("{}", text);
        return Ok(());
    }

    let now = SystemClock::new().rtc_secs();
    println!("=== Device State ===");
    println!("File: {}", path.display());
    println!("Version: {}", state.version);
    println!("Node: {}", state.my_node.my_node_num);
    println!("Owner: {} ({})", state.owner.long_name, state.owner.short_name);
    if state.no_save {
        println!("Development mode: saving disabled");
    }
    println!();
    println!("Nodes ({}):", state.node_db.len());
    println!(
        "  {:<10} {:<20} {:>6} {:>10} {:>8}",
        "Node", "Name", "SNR", "Last seen", "Position"
    );
    for record in &state.node_db {
        let name = record
            .user
            .as_ref()
            .map(|u| u.long_name.as_str())
            .unwrap_or("-");
        let seen = if record.last_heard == 0 {
            "never".to_string()
        } else {
            format!("{}s", record.since_last_seen(now))
        };
        println!(
            "  {:<10} {:<20} {:>6.1} {:>10} {:>8}",
            record.num.to_string(),
            name,
            record.snr,
            seen,
            if record.has_position() { "yes" } else { "no" }
        );
    }
    Ok(())
}

fn cmd_airtime(len: usize, preset: Option<String>) -> Result<()> {
    let presets = match preset {
        Some(name) => vec![parse_preset(&name)?],
        None => ModemPreset::ALL.to_vec(),
    };
    let on_air = len + MeshPacket::HEADER_SIZE;

    println!("=== Airtime ({} byte payload, {} bytes on air) ===", len, on_air);
    println!(
        "  {:<14} {:>4} {:>8} {:>4} {:>11} {:>9} {:>13}",
        "Preset", "SF", "BW(kHz)", "CR", "Airtime", "Slot", "Retry delay"
    );
    for preset in presets {
        let (sf, bw, cr) = preset.lora_params();
        let model = AirtimeModel::new(preset);
        println!(
            "  {:<14} {:>4} {:>8} {:>4} {:>9.1}ms {:>7.1}ms {:>11.1}ms",
            format!("{:?}", preset),
            sf,
            bw / 1000,
            format!("4/{}", cr),
            model.airtime(on_air).as_secs_f64() * 1000.0,
            model.slot_time().as_secs_f64() * 1000.0,
            model.retransmission_delay(on_air, 0).as_secs_f64() * 1000.0,
        );
    }
    Ok(())
}

fn cmd_run(config: MeshConfig, duration: u64, interval: u64, loss: f64) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(run_pair(config, duration, interval, loss))
}

async fn run_pair(config: MeshConfig, duration: u64, interval: u64, loss: f64) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let mut nodes: Vec<MeshService<SimRadio>> = (0..2)
        .map(|_| {
            MeshService::init(
                MeshConfig {
                    no_save: true,
                    ..config.clone()
                },
                SimRadio::new(config.modem_preset, clock.clone()),
                clock.clone(),
                Box::new(MemoryStorage::new()),
                random_mac(),
            )
        })
        .collect();

    println!("=== Live Mesh ===");
    println!("Node A: {}", nodes[0].node_num());
    println!("Node B: {}", nodes[1].node_num());
    println!("Running for {}s, a message every {}s", duration, interval);
    println!();

    for node in &mut nodes {
        node.send_owner(NodeNum::BROADCAST, false)?;
    }

    let start = Instant::now();
    let end = start + Duration::from_secs(duration);
    let interval = Duration::from_secs(interval.max(1));
    let mut next_message = start;
    let mut sent = 0u32;
    let mut rng = rand::thread_rng();

    while Instant::now() < end {
        if Instant::now() >= next_message {
            sent += 1;
            let dest = nodes[1].node_num();
            let id = nodes[0].send_text(dest, &format!("ping {}", sent), true)?;
            info!("Sent ping 0x{:08x}", id);
            next_message += interval;
        }

        // Carry frames between the two radios
        for src in 0..2 {
            let dst = 1 - src;
            for mut frame in nodes[src].radio_mut().take_outbox() {
                if rng.gen::<f64>() < loss {
                    warn!(id = frame.id, "Frame lost");
                    continue;
                }
                frame.rx_time = clock.rtc_secs();
                frame.rx_snr = rng.gen_range(0.0..10.0);
                nodes[dst].radio_mut().record_heard(&frame);
                nodes[dst].handle_from_radio(frame);
            }
        }

        let mut wake = Duration::from_millis(100);
        for (idx, node) in nodes.iter_mut().enumerate() {
            if let Some(delay) = node.run_once() {
                wake = wake.min(delay);
            }
            for packet in node.drain_received() {
                println!(
                    "[{}] {} <- {}: {}",
                    if idx == 0 { "A" } else { "B" },
                    node.node_num(),
                    packet.sender(node.node_num()),
                    describe(&packet)
                );
            }
        }

        tokio::time::sleep(wake.max(Duration::from_millis(10))).await;
    }

    println!();
    println!("=== Summary ===");
    for (label, node) in ["A", "B"].iter().zip(&nodes) {
        let stats = node.router().stats();
        println!(
            "{} {}: db={} online={} reliable={} retx={} acks={} naks={}",
            label,
            node.node_num(),
            node.node_db().len(),
            node.num_online_nodes(),
            stats.reliable_sends,
            stats.retransmissions,
            stats.acks_received,
            stats.naks_received
        );
    }
    Ok(())
}
