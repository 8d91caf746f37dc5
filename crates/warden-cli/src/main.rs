//! Warden CLI - operator front-end for the plugin host.
//!
//! Discovers, seals, verifies and runs plugin modules. Configuration comes
//! from the environment (`PLUGIN_*`, optionally via `.env`).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use warden_plugin::package::signed_digest;
use warden_plugin::{
    embed_descriptor, seal, HostConfig, PluginImage, PluginRegistry, SandboxLevel,
    SecurityEvent, TrustStore, WorkerCommand,
};

/// Warden - sandboxed plugin host
#[derive(Parser)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Trust store file (overrides PLUGIN_TRUST_STORE)
    #[arg(long, global = true)]
    trust_store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List plugins found on the search path without loading them
    Discover {
        /// Directories to scan (default: PLUGIN_SEARCH_PATH)
        #[arg(short, long)]
        path: Vec<PathBuf>,
    },

    /// Print the digest of a module's signed region
    Digest { module: PathBuf },

    /// Embed a descriptor into a module and seal it
    Seal {
        module: PathBuf,

        /// TOML descriptor with a [plugin] table
        #[arg(short, long)]
        descriptor: PathBuf,

        /// Output path (default: overwrite the input)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Append the digest to this trust store file
        #[arg(long)]
        trust: Option<PathBuf>,
    },

    /// Check a module's signature against the trust store
    Verify { module: PathBuf },

    /// Load a plugin, run one operation and unload it
    Run {
        module: PathBuf,

        /// Operation name
        operation: String,

        /// JSON parameters
        #[arg(default_value = "null")]
        params: String,

        /// Sandbox level (default: PLUGIN_DEFAULT_SANDBOX)
        #[arg(short, long)]
        level: Option<SandboxLevel>,
    },

    /// Serve one plugin over stdin/stdout (spawned by the host)
    #[command(hide = true)]
    Worker,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Commands::Worker = cli.command {
        warden_plugin::process::serve(std::io::stdin().lock(), std::io::stdout().lock())?;
        return Ok(());
    }

    let mut config = HostConfig::from_env();
    if let Some(store) = cli.trust_store {
        config.trust_store = Some(store);
    }
    if config.sandbox.worker.is_none() {
        // Out-of-line plugins run in a copy of this binary.
        let exe = std::env::current_exe().context("locating the warden binary")?;
        config.sandbox.worker = Some(WorkerCommand::new(exe).arg("worker"));
    }

    match cli.command {
        Commands::Discover { path } => discover(config, path),
        Commands::Digest { module } => digest(&module),
        Commands::Seal {
            module,
            descriptor,
            output,
            trust,
        } => seal_module(&module, &descriptor, output, trust),
        Commands::Verify { module } => verify(config, &module),
        Commands::Run {
            module,
            operation,
            params,
            level,
        } => run(config, &module, &operation, &params, level),
        Commands::Worker => Ok(()),
    }
}

fn discover(mut config: HostConfig, paths: Vec<PathBuf>) -> Result<()> {
    if !paths.is_empty() {
        config.search_paths = paths;
    }
    let registry = PluginRegistry::new(config)?;
    for metadata in registry.discover_plugins() {
        println!("{}", serde_json::to_string(&metadata)?);
    }
    Ok(())
}

fn digest(module: &PathBuf) -> Result<()> {
    let bytes = std::fs::read(module).with_context(|| format!("reading {}", module.display()))?;
    println!("{}", signed_digest(&bytes)?);
    Ok(())
}

fn seal_module(
    module: &PathBuf,
    descriptor: &PathBuf,
    output: Option<PathBuf>,
    trust: Option<PathBuf>,
) -> Result<()> {
    let bytes = std::fs::read(module).with_context(|| format!("reading {}", module.display()))?;
    let toml = std::fs::read_to_string(descriptor)
        .with_context(|| format!("reading {}", descriptor.display()))?;

    // Reject a bad descriptor here rather than at load time.
    warden_plugin::metadata::parse_descriptor(&toml)?;

    let sealed = seal(&embed_descriptor(&bytes, &toml)?)?;
    let output = output.unwrap_or_else(|| module.clone());
    std::fs::write(&output, &sealed.bytes)
        .with_context(|| format!("writing {}", output.display()))?;

    if let Some(store_path) = trust {
        let mut store = if store_path.exists() {
            TrustStore::load(&store_path)?
        } else {
            TrustStore::new()
        };
        let label = output
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        store.trust(&sealed.digest, label)?;
        std::fs::write(&store_path, store.to_toml_string())
            .with_context(|| format!("writing {}", store_path.display()))?;
        tracing::info!(store = %store_path.display(), "digest trusted");
    }

    println!("{}", sealed.digest);
    Ok(())
}

fn verify(config: HostConfig, module: &PathBuf) -> Result<()> {
    let registry = PluginRegistry::new(config)?;
    if registry.verify_plugin_signature(module) {
        println!("trusted");
        return Ok(());
    }

    let image = PluginImage::read(module, warden_plugin::package::DEFAULT_MAX_IMAGE_SIZE)?;
    bail!(
        "{} is not trusted (signed-region digest {})",
        module.display(),
        signed_digest(image.bytes())?
    )
}

fn run(
    config: HostConfig,
    module: &PathBuf,
    operation: &str,
    params: &str,
    level: Option<SandboxLevel>,
) -> Result<()> {
    let registry = PluginRegistry::new(config)?;
    let level = level.unwrap_or_else(|| registry.default_sandbox_level());

    registry.register_security_event_callback(|event| {
        if let SecurityEvent::ShutdownFault { plugin, reason } = event {
            tracing::error!(plugin = %plugin, "shutdown fault: {reason}");
        }
    });

    let metadata = registry.try_load_plugin(module, level)?;
    let output = registry.execute_plugin_operation(&metadata.name, operation, params);
    registry.unload_plugin(&metadata.name);

    match output {
        Some(output) => {
            println!("{output}");
            Ok(())
        }
        None => bail!("operation '{operation}' failed on plugin '{}'", metadata.name),
    }
}
