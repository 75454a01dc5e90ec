// NowChat Linux: console chat over a UDP-emulated radio link.

mod blob_store;
mod config;
mod console;
mod link;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use nowchat_core::{
    inbound::DEFAULT_INBOUND_CAPACITY, DisplayMessage, EngineConfig, LinkAddress,
    MessageType, ProtocolEngine, SecurityManager, UiEvent,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing_subscriber::EnvFilter;

use crate::blob_store::DirBlobStore;
use crate::console::{Console, Reply};
use crate::link::UdpLink;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const TICK: Duration = Duration::from_millis(50);

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("nowchat-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn security_from(cfg: &config::Config, address: &LinkAddress) -> anyhow::Result<SecurityManager> {
    let mut security = SecurityManager::for_link_address(address);
    if let Some(name) = &cfg.display_name {
        security.set_display_name(name);
    }

    if let Some(path) = &cfg.state_file {
        match std::fs::read(path) {
            Ok(bytes) => match security.restore_state(&bytes) {
                Ok(()) => return Ok(security),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "ignoring saved network"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "unreadable state file"),
        }
    }

    let Some(password) = &cfg.network_password else {
        tracing::warn!("no network password configured; frames cannot be sent or verified");
        return Ok(security);
    };
    match &cfg.network_name {
        Some(name) => {
            security
                .create_network(password, name)
                .context("creating network")?;
            if let Some(path) = &cfg.state_file {
                let state = security.export_state()?;
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                std::fs::write(path, state)
                    .with_context(|| format!("writing {}", path.display()))?;
            }
        }
        None => security.join_network(password).context("joining network")?,
    }
    Ok(security)
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let local = match &cfg.link_address {
        Some(s) => s.parse::<LinkAddress>()?,
        None => LinkAddress::random_local(),
    };
    let security = security_from(&cfg, &local)?;
    tracing::info!(
        address = %local,
        device_id = security.device_id(),
        name = security.display_name(),
        network = security.network_name(),
        port = cfg.port,
        "starting"
    );

    let socket = link::bind(cfg.port)
        .await
        .with_context(|| format!("binding udp port {}", cfg.port))?;
    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let engine_config = EngineConfig {
        sweep_interval_ms: cfg.sweep_interval_secs.saturating_mul(1000),
        ..EngineConfig::default()
    };
    let mut engine = ProtocolEngine::with_config(
        security,
        UdpLink::broadcast(socket.clone(), local, cfg.port),
        ui_tx,
        engine_config,
    );
    let store = DirBlobStore::new(&cfg.blob_dir);
    engine.set_blob_sink(Box::new(store.clone()));
    let mut console = Console::new(store);

    let (handle, mut inbound) = engine.receive_channel(DEFAULT_INBOUND_CAPACITY);
    tokio::spawn(async move {
        if let Err(e) = link::run_receiver(socket, local, handle).await {
            tracing::error!(error = %e, "receiver stopped");
        }
    });

    let mut tick = tokio::time::interval(TICK);
    let mut presence =
        tokio::time::interval(Duration::from_secs(cfg.presence_interval_secs.max(1)));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    println!("type /help for commands");
    loop {
        tokio::select! {
            Some(verified) = inbound.recv() => {
                engine.dispatch(verified, now_ms());
            }
            _ = tick.tick() => {
                engine.poll(now_ms());
            }
            _ = presence.tick() => {
                if let Err(e) = engine.send_presence(now_ms()) {
                    tracing::debug!(error = %e, "presence not sent");
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match console::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(cmd)) => match console.execute(&mut engine, cmd, now_ms()) {
                        Ok(Reply::Lines(out)) => out.iter().for_each(|l| println!("{l}")),
                        Ok(Reply::Quit) => break,
                        Err(e) => println!("! {e:#}"),
                    },
                    Err(e) => println!("! {e}"),
                }
            }
            res = &mut shutdown => {
                res?;
                break;
            }
        }
        print_events(&engine, &mut ui_rx);
    }
    tracing::info!("shutting down");
    Ok(())
}

/// Print display lines for every `MessageAdded` since the last call.
fn print_events<L, S>(engine: &ProtocolEngine<L, S>, ui_rx: &mut UnboundedReceiver<UiEvent>)
where
    L: nowchat_core::RadioLink,
    S: nowchat_core::UiEventSink,
{
    let mut added = 0;
    while let Ok(event) = ui_rx.try_recv() {
        match event {
            UiEvent::MessageAdded => added += 1,
            UiEvent::TransferComplete { id } => println!("* received blob {id}"),
            UiEvent::PeerJoined { .. } | UiEvent::PeerLeft => {}
        }
    }
    let display = engine.display();
    let skip = display.len().saturating_sub(added);
    for message in display.iter().skip(skip) {
        println!("{}", render(message));
    }
}

fn render(m: &DisplayMessage) -> String {
    match m.msg_type {
        MessageType::System => format!("-- {}", m.content),
        _ if m.own => format!("[{}] me: {}", m.channel, m.content),
        MessageType::Direct => format!("(dm) {}: {}", m.sender_name, m.content),
        _ => format!("[{}] {}: {}", m.channel, m.sender_name, m.content),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
