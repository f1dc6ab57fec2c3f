//! CLI entry point (spec §6.1): config derivation utilities run
//! synchronously and exit immediately; running the node itself hands off
//! to a multi-threaded Tokio runtime, mirroring the teacher's
//! `fn main() { ... std::process::exit(runtime.block_on(async_main(...))) }`
//! shape.

mod logging;
mod node;

use std::io::Read;
use std::path::PathBuf;

use clap::Parser;
use meshnode_address::{derive_address, derive_subnet, Prefix};
use meshnode_config::NodeConfig;

#[derive(Parser, Debug)]
#[command(
    name = "meshnode",
    about = "End-to-end encrypted IPv6 overlay mesh node",
    disable_version_flag = true
)]
struct Cli {
    /// Print a new HJSON config to stdout.
    #[arg(long)]
    genconf: bool,
    /// With --genconf/--normaliseconf, emit JSON instead of HJSON.
    #[arg(long)]
    json: bool,
    /// Read config from stdin.
    #[arg(long)]
    useconf: bool,
    /// Read config from file.
    #[arg(long, value_name = "PATH")]
    useconffile: Option<PathBuf>,
    /// Re-emit the given config in canonical form.
    #[arg(long)]
    normaliseconf: bool,
    /// Output the private key in PEM.
    #[arg(long)]
    exportkey: bool,
    /// Synthesize a random ephemeral config.
    #[arg(long)]
    autoconf: bool,
    /// Derive and print this node's address, then exit.
    #[arg(long)]
    address: bool,
    /// Derive and print this node's subnet, then exit.
    #[arg(long)]
    subnet: bool,
    /// Derive and print this node's public key, then exit.
    #[arg(long)]
    publickey: bool,
    /// Print build info.
    #[arg(long)]
    version: bool,
    #[arg(long, value_name = "TARGET", default_value = "stdout")]
    logto: String,
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    loglevel: String,
    /// Override admin HTTP listen address.
    #[arg(long, value_name = "URL")]
    httpaddress: Option<String>,
    /// Override static assets directory.
    #[arg(long, value_name = "PATH")]
    wwwroot: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli));
}

fn fail(e: impl std::fmt::Display) -> i32 {
    eprintln!("meshnode: {e}");
    1
}

fn run(cli: Cli) -> i32 {
    if cli.version {
        print_version();
        return 0;
    }

    if let Some(level) = parse_loglevel_or_fail(&cli.loglevel) {
        let target = logging::parse_logto(&cli.logto);
        if let Err(e) = logging::init(&target, level) {
            return fail(format!("failed to initialize logging: {e}"));
        }
    } else {
        return 1;
    }

    if cli.genconf {
        return match genconf(&cli) {
            Ok(()) => 0,
            Err(e) => fail(e),
        };
    }

    let mut config = match resolve_config(&cli) {
        Ok(c) => c,
        Err(e) => return fail(e),
    };
    apply_overrides(&mut config, &cli);

    if cli.normaliseconf {
        return match emit_config(&config) {
            Ok(()) => 0,
            Err(e) => fail(e),
        };
    }

    if cli.exportkey {
        return match export_key(&config) {
            Ok(()) => 0,
            Err(e) => fail(e),
        };
    }

    if cli.address || cli.subnet || cli.publickey {
        return match derive_and_print(&cli, &config) {
            Ok(()) => 0,
            Err(e) => fail(e),
        };
    }

    run_node(cli, config)
}

fn parse_loglevel_or_fail(value: &str) -> Option<tracing_subscriber::filter::LevelFilter> {
    match logging::parse_loglevel(value) {
        Ok(level) => Some(level),
        Err(e) => {
            eprintln!("meshnode: {e}");
            None
        }
    }
}

fn print_version() {
    println!(
        "meshnode {} ({} {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

fn resolve_config(cli: &Cli) -> Result<NodeConfig, String> {
    if cli.autoconf {
        return Ok(node::autoconf());
    }
    if let Some(path) = &cli.useconffile {
        let bytes = std::fs::read(path).map_err(|e| format!("reading {}: {e}", path.display()))?;
        return meshnode_config::parse_bytes(&bytes).map_err(|e| e.to_string());
    }
    if cli.useconf {
        let mut bytes = Vec::new();
        std::io::stdin()
            .read_to_end(&mut bytes)
            .map_err(|e| format!("reading stdin: {e}"))?;
        return meshnode_config::parse_bytes(&bytes).map_err(|e| e.to_string());
    }
    Err("no config source given; pass --useconffile, --useconf, or --autoconf".to_string())
}

fn apply_overrides(config: &mut NodeConfig, cli: &Cli) {
    if let Some(addr) = &cli.httpaddress {
        config.http_address = Some(addr.clone());
    }
    if let Some(root) = &cli.wwwroot {
        config.www_root = Some(root.display().to_string());
    }
}

fn genconf(cli: &Cli) -> Result<(), String> {
    let config = node::autoconf();
    let _ = cli.json; // our writer emits valid-HJSON JSON either way; see DESIGN.md
    emit_config(&config)
}

fn emit_config(config: &NodeConfig) -> Result<(), String> {
    let bytes = meshnode_config::to_bytes(config).map_err(|e| e.to_string())?;
    std::io::Write::write_all(&mut std::io::stdout(), &bytes).map_err(|e| e.to_string())?;
    println!();
    Ok(())
}

fn export_key(config: &NodeConfig) -> Result<(), String> {
    let identity = node::resolve_identity(config).map_err(|e| e.to_string())?;
    println!("{}", meshnode_config::export_private_key_pem(identity.signing_key()));
    Ok(())
}

fn derive_and_print(cli: &Cli, config: &NodeConfig) -> Result<(), String> {
    let domain = config.domain.clone().ok_or_else(|| "no Domain configured".to_string())?;
    let prefix = config.network_domain.prefix.map(Prefix).unwrap_or_default();

    if cli.address {
        let addr = derive_address(prefix, &domain).map_err(|e| e.to_string())?;
        println!("{addr}");
    }
    if cli.subnet {
        let subnet = derive_subnet(prefix, &domain).map_err(|e| e.to_string())?;
        println!("{subnet}");
    }
    if cli.publickey {
        let identity = node::resolve_identity(config).map_err(|e| e.to_string())?;
        println!("{}", hex::encode(identity.public_key()));
    }
    Ok(())
}

fn run_node(cli: Cli, config: NodeConfig) -> i32 {
    let config_path = cli.useconffile.clone();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => return fail(format!("failed to start Tokio runtime: {e}")),
    };
    runtime.block_on(async_main(config, config_path))
}

async fn async_main(config: NodeConfig, config_path: Option<PathBuf>) -> i32 {
    let runtime = match node::start(config, config_path).await {
        Ok(runtime) => runtime,
        Err(e) => return fail(format!("fatal: {e}")),
    };
    tracing::info!("meshnode running, waiting for shutdown signal");
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received, tearing down");
    runtime.shutdown().await;
    0
}
