//! Fleet provisioning CLI.
//!
//! Builds VM definitions from flags, runs a whole batch through the
//! orchestrator, and prints a per-VM verdict with an optional JSON
//! report for machines to read.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use alpine_fleet::hypervisor::libvirt::DEFAULT_URI;
use alpine_fleet::{
    AlpineSetup, BatchOutcome, BatchPolicy, HypervisorDriver, InstallState, LibvirtDriver,
    MediaCache, MediaRef, NetworkMode, ProvisioningOrchestrator, QemuDriver, ScriptFile,
    VmDefinition,
};

#[derive(Parser)]
#[command(name = "alpine-fleet")]
#[command(about = "Unattended Alpine Linux VM fleet provisioner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a fleet of VMs and drive each install to completion
    Run(RunArgs),

    /// Print the built-in install dialogue as TOML (edit, then pass
    /// back with --script)
    Script {
        /// Hostname answered to the installer
        #[arg(long, default_value = "alpine")]
        hostname: String,

        /// Keyboard layout and variant
        #[arg(long, default_value = "us")]
        keymap: String,

        /// Disk mode as setup-alpine understands it (sys, data, ...)
        #[arg(long, default_value = "sys")]
        disk_mode: String,

        /// Root password typed into the installer
        #[arg(long, default_value = "alpine123")]
        root_password: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Number of VMs to provision
    #[arg(long, default_value_t = 3)]
    count: usize,

    /// VM name prefix; VMs are named <prefix>1..<prefix>N
    #[arg(long, default_value = "alpine")]
    name_prefix: String,

    /// Memory per VM in MiB
    #[arg(long, default_value_t = 512)]
    memory_mib: u32,

    /// Virtual CPUs per VM
    #[arg(long, default_value_t = 1)]
    vcpus: u32,

    /// System disk size per VM in GiB
    #[arg(long, default_value_t = 2)]
    disk_gib: u32,

    /// Release mirror host (scheme optional, https assumed)
    #[arg(long, default_value = "dl-cdn.alpinelinux.org")]
    mirror: String,

    /// Alpine release version
    #[arg(long, default_value = "3.20.0")]
    version: String,

    /// Guest architecture
    #[arg(long, default_value = "x86_64")]
    arch: String,

    /// Start VMs without any NIC
    #[arg(long)]
    no_network: bool,

    /// Hypervisor backend
    #[arg(long, value_enum, default_value_t = Backend::Qemu)]
    backend: Backend,

    /// libvirt connection URI (libvirt backend only)
    #[arg(long, default_value = DEFAULT_URI)]
    libvirt_uri: String,

    /// Directory for disk images and cached ISOs
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Maximum simultaneously active installs
    #[arg(long, default_value_t = 2)]
    concurrency: usize,

    /// Stop launching new VMs after the first failure
    #[arg(long)]
    fail_fast: bool,

    /// Keep failed VMs running for inspection instead of destroying them
    #[arg(long)]
    preserve_failed: bool,

    /// Extra wall-clock slack per VM on top of the script's summed waits
    #[arg(long, default_value_t = 60)]
    budget_slack_secs: u64,

    /// Install dialogue TOML; defaults to the built-in setup-alpine
    /// script (the answer flags below are then ignored)
    #[arg(long)]
    script: Option<PathBuf>,

    /// Hostname answered to the installer
    #[arg(long, default_value = "alpine")]
    hostname: String,

    /// Keyboard layout and variant
    #[arg(long, default_value = "us")]
    keymap: String,

    /// Disk mode as setup-alpine understands it (sys, data, ...)
    #[arg(long, default_value = "sys")]
    disk_mode: String,

    /// Root password typed into the installer
    #[arg(long, default_value = "alpine123")]
    root_password: String,

    /// Write the batch result as pretty JSON
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Backend {
    Qemu,
    Libvirt,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Qemu => write!(f, "qemu"),
            Self::Libvirt => write!(f, "libvirt"),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_fleet(args),
        Commands::Script {
            hostname,
            keymap,
            disk_mode,
            root_password,
        } => {
            let setup = AlpineSetup {
                hostname,
                keymap,
                disk_mode,
                root_password,
            };
            println!("{}", ScriptFile::alpine(&setup).to_toml()?);
            Ok(())
        }
    }
}

fn run_fleet(args: RunArgs) -> Result<()> {
    println!("{}", "Alpine Fleet Provisioner".bold());
    println!();

    let media = MediaRef::new(&args.mirror, &args.version, &args.arch);
    let network = if args.no_network {
        NetworkMode::None
    } else {
        NetworkMode::UserNat
    };
    let definitions: Vec<VmDefinition> = (1..=args.count)
        .map(|i| {
            VmDefinition::new(format!("{}{}", args.name_prefix, i), media.clone())
                .memory_mib(args.memory_mib)
                .vcpus(args.vcpus)
                .disk_gib(args.disk_gib)
                .network(network)
        })
        .collect();

    let (script, profile) = match &args.script {
        Some(path) => ScriptFile::load(path)
            .with_context(|| format!("load install script {}", path.display()))?
            .into_parts(),
        None => ScriptFile::alpine(&AlpineSetup {
            hostname: args.hostname.clone(),
            keymap: args.keymap.clone(),
            disk_mode: args.disk_mode.clone(),
            root_password: args.root_password.clone(),
        })
        .into_parts(),
    };

    let work_dir = args
        .work_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("alpine-fleet"));
    let driver: Box<dyn HypervisorDriver> = match args.backend {
        Backend::Qemu => Box::new(QemuDriver::new(work_dir.join("vms"))),
        Backend::Libvirt => {
            Box::new(LibvirtDriver::new(work_dir.join("vms")).with_uri(&args.libvirt_uri))
        }
    };
    let cache = MediaCache::new(work_dir.join("iso"));

    println!("  VMs:         {} ({}1..{}{})", args.count, args.name_prefix, args.name_prefix, args.count);
    println!("  Topology:    {} MiB, {} vcpu, {} GiB disk", args.memory_mib, args.vcpus, args.disk_gib);
    println!("  Media:       {}", MediaCache::download_url(&media));
    println!("  Backend:     {}", args.backend);
    println!("  Work dir:    {}", work_dir.display());
    println!("  Concurrency: {}", args.concurrency);
    println!();

    let policy = BatchPolicy {
        concurrency_limit: args.concurrency,
        fail_fast: args.fail_fast,
        preserve_failed: args.preserve_failed,
        budget_slack: std::time::Duration::from_secs(args.budget_slack_secs),
    };
    let orchestrator = ProvisioningOrchestrator::new(driver, cache).with_policy(policy);

    println!("{}", "Provisioning...".cyan());
    let batch = orchestrator.provision_batch(definitions, &script, &profile)?;

    println!();
    println!("{}", "━".repeat(60));
    println!();

    for (name, result) in &batch.results {
        match &result.final_state {
            InstallState::Completed => {
                println!(
                    "  {} {} ({:.1}s)",
                    "✓".green().bold(),
                    name,
                    result.elapsed.as_secs_f64()
                );
            }
            InstallState::Disconnected if result.error.is_none() => {
                println!("  {} {} (never launched)", "-".yellow(), name);
            }
            _ => {
                println!(
                    "  {} {} ({:.1}s)",
                    "✗".red().bold(),
                    name,
                    result.elapsed.as_secs_f64()
                );
                if let Some(error) = &result.error {
                    println!("      {error}");
                }
                let tail = result.transcript.len().saturating_sub(5);
                for line in &result.transcript[tail..] {
                    println!("      | {line}");
                }
            }
        }
    }

    println!();
    println!("  {} completed, {} failed", batch.completed(), batch.failed());

    if let Some(report) = &args.report {
        let json = serde_json::to_string_pretty(&batch)?;
        std::fs::write(report, json)
            .with_context(|| format!("write report {}", report.display()))?;
        println!("  Report: {}", report.display());
    }

    match batch.outcome {
        BatchOutcome::Success => {
            println!();
            println!("{}", "All installs completed.".green().bold());
            Ok(())
        }
        outcome => bail!(
            "batch finished with {outcome}: {}/{} completed",
            batch.completed(),
            batch.results.len()
        ),
    }
}
