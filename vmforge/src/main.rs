use clap::Parser;
use std::path::PathBuf;

use vmforge::{ControllerConfig, VmforgeError, VmforgeOrchestrator, VmforgeResult};
use vmforge_core::{abstractions::cancel_pair, spec_parser::VirtualMachineDocument};

#[derive(Parser)]
#[command(name = "vmforge")]
#[command(about = "Declarative virtual-machine lifecycle controller", long_about = None)]
struct Cli {
    /// Configuration file (TOML); environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Create or update a VM from a YAML or JSON document
    Apply {
        #[arg(long)]
        spec: PathBuf,
    },
    /// Refresh and show a tracked VM
    Read {
        #[arg(long)]
        name: String,
    },
    /// Power off and destroy a tracked VM
    Destroy {
        #[arg(long)]
        name: String,
    },
    /// List tracked VMs
    List,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config) {
        eprintln!("Error initializing logging: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(cli.command, config).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&PathBuf>) -> VmforgeResult<ControllerConfig> {
    match path {
        Some(path) => ControllerConfig::from_file(path),
        None => ControllerConfig::from_env(),
    }
}

fn init_logging(config: &ControllerConfig) -> VmforgeResult<()> {
    let directive = format!("vmforge={}", config.log_level);
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(
        directive
            .parse()
            .map_err(|e| VmforgeError::ConfigError(format!("Invalid log directive: {}", e)))?,
    );

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn run(command: Commands, config: ControllerConfig) -> VmforgeResult<()> {
    if let Commands::Config = command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let orchestrator = VmforgeOrchestrator::new(&config)?;

    // Ctrl-C cancels whatever wait is in flight
    let (handle, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            handle.cancel();
        }
    });

    match command {
        Commands::Apply { spec } => {
            let document = VirtualMachineDocument::from_file(&spec)?;
            let tracked = orchestrator.apply(&document, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&tracked)?);
        }
        Commands::Read { name } => {
            let tracked = orchestrator.read(&name, &cancel).await?;
            if tracked.is_tracked() {
                println!("{}", serde_json::to_string_pretty(&tracked)?);
            } else {
                println!("VM '{}' no longer exists; dropped from tracked state", name);
            }
        }
        Commands::Destroy { name } => {
            orchestrator.destroy(&name, &cancel).await?;
            println!("Successfully destroyed VM '{}'", name);
        }
        Commands::List => {
            let vms = orchestrator.list()?;
            if vms.is_empty() {
                println!("No tracked VMs");
            } else {
                println!("Tracked VMs:");
                for vm in vms {
                    println!(
                        "  - {}: {}vcpu, {}MB, ip {}",
                        vm.id,
                        vm.cpu.unwrap_or(vm.spec.vcpu),
                        vm.memory_mb.unwrap_or(vm.spec.memory_mb),
                        vm.ip_address.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Commands::Config => {}
    }

    Ok(())
}
