//! adcx command-line interface.

mod config;

use adcx_core::{ClientEvent, Core, CoreSettings, HubSettings, Priority, Search};
use adcx_proto::tth::{block_size, TigerTree};
use adcx_share::profile::ShareRoot;
use adcx_share::{RefreshKind, ShareValidator};
use adcx_transfer::UploadConfig;
use anyhow::Context;
use clap::{Parser, Subcommand};
use config::Config;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

/// adcx - ADC Direct Connect peer core
#[derive(Parser)]
#[command(name = "adcx")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/adcx/config.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a hub and stay online
    Connect {
        /// Hub URL (adc://host:port or adcs://host:port)
        #[arg(required = true)]
        url: String,

        /// Run a search once logged in
        #[arg(long)]
        search: Option<String>,
    },

    /// Hash a file and print its TTH root
    Hash {
        /// File to hash
        #[arg(required = true)]
        file: PathBuf,
    },

    /// Refresh the configured share and print totals
    Share,

    /// Print the stored identity (CID)
    Id,
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

fn build_core(config: &Config) -> anyhow::Result<Arc<Core>> {
    let pid = config.pid()?;
    let hub_defaults = HubSettings {
        nick: config.identity.nick.clone(),
        description: config.identity.description.clone(),
        auto_reconnect: config.hubs.auto_reconnect,
        allow_untrusted: config.hubs.allow_untrusted,
        tcp_port: config.hubs.tcp_port,
        udp_port: config.hubs.udp_port,
        user_ip4: config.hubs.external_ip4.clone(),
        active_v4: config.hubs.tcp_port != 0 && !config.hubs.external_ip4.is_empty(),
        ..HubSettings::default()
    };

    let core = Core::new(CoreSettings {
        pid: Some(pid),
        upload: UploadConfig {
            slots: config.uploads.slots,
            extra_slots: config.uploads.extra_slots,
            minislot_size: config.uploads.minislot_kib * 1024,
            ..UploadConfig::default()
        },
        hub_defaults,
        partial_sources: None,
        hash_store: None,
    });

    configure_share(&core.validator(), config)?;
    for root in &config.share.roots {
        let name = if root.name.is_empty() {
            root.path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "Share".to_string())
        } else {
            root.name.clone()
        };
        core.refresh().register_root(Arc::new(ShareRoot::new(
            root.path.clone(),
            name,
            [0u32].into_iter().collect(),
            root.incoming,
        )));
    }

    Ok(core)
}

fn configure_share(validator: &ShareValidator, config: &Config) -> anyhow::Result<()> {
    if !config.share.skiplist.is_empty() {
        validator
            .set_skiplist(
                &config.share.skiplist,
                adcx_share::validator::SkiplistMode::Glob,
            )
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    for path in &config.share.excluded {
        validator.add_excluded(path);
    }
    Ok(())
}

async fn run_connect(core: Arc<Core>, url: String, search: Option<String>) -> anyhow::Result<()> {
    let mut events = core
        .take_events()
        .context("event stream already taken")?;

    core.start();
    let _ = core.refresh_all();
    let client = core.connect_hub(&url, None);
    let mut searched = false;

    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::LoggedIn => {
                println!("logged in to {url}");
                if let (Some(query), false) = (&search, searched) {
                    client.queue_search(Search::new(query.clone(), "cli", Priority::High));
                    searched = true;
                }
            }
            ClientEvent::StatusMessage { severity, text, .. } => {
                println!("[{severity:?}] {text}");
            }
            ClientEvent::Chat(message) => {
                println!("<{}> {}", message.from.nick(), message.text);
            }
            ClientEvent::PrivateMessage(message) => {
                println!("*PM* <{}> {}", message.from.nick(), message.text);
            }
            ClientEvent::SearchResult { command, user } => {
                let path = command.named("FN", 0).unwrap_or("?");
                let size = command.named("SI", 0).unwrap_or("?");
                println!("result from {}: {} ({} bytes)", user.nick(), path, size);
            }
            ClientEvent::ConnectToMe(request) => {
                let ip = request.user.identity().ip4().to_string();
                adcx_core::peer::connect_to_peer(
                    core.context(),
                    ip,
                    request.port,
                    request.token.clone(),
                    request.secure,
                    request.user.user.cid,
                );
            }
            ClientEvent::IncomingSearch { command, user, udp_reply } => {
                core.respond_to_search(&client, &command, user.sid(), udp_reply);
            }
            ClientEvent::Disconnected { reason } => {
                println!("disconnected: {reason}");
            }
            ClientEvent::Redirect { url } => {
                println!("redirected to {url} (not following)");
            }
            _ => {}
        }
    }
    Ok(())
}

fn run_hash(file: &PathBuf) -> anyhow::Result<()> {
    let mut handle = std::fs::File::open(file)
        .with_context(|| format!("opening {}", file.display()))?;
    let size = handle.metadata()?.len();

    let mut tree = TigerTree::new(block_size(size));
    let mut buffer = vec![0u8; 256 * 1024];
    loop {
        let read = handle.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        tree.update(&buffer[..read]);
    }
    let hashed = tree.finalize();
    println!("{}  {}", hashed.root.to_base32(), file.display());
    Ok(())
}

async fn run_share(core: Arc<Core>) -> anyhow::Result<()> {
    core.refresh().start();
    let stats = core
        .refresh()
        .refresh_blocking(RefreshKind::Startup)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let (bytes, files) = core.context().tree.total_stats();
    println!(
        "share: {files} files, {bytes} bytes ({} new, {} reused, {} skipped)",
        stats.new_files, stats.existing_files, stats.skipped
    );
    core.refresh().shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "info" })
        .init();

    let config_path = expand_home(&cli.config);
    let config = Config::load_or_init(&config_path)?;

    match cli.command {
        Commands::Connect { url, search } => {
            let core = build_core(&config)?;
            run_connect(core, url, search).await
        }
        Commands::Hash { file } => run_hash(&file),
        Commands::Share => {
            let core = build_core(&config)?;
            run_share(core).await
        }
        Commands::Id => {
            let pid = config.pid()?;
            println!("CID: {}", pid.derive_cid().to_base32());
            Ok(())
        }
    }
}
