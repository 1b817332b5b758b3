//! kvm-bench: VM performance benchmarking on a local KVM/QEMU host
//!
//! Provisions guests for each size in the test matrix, runs the configured
//! benchmarks inside them, and writes a structured report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use comfy_table::{Cell, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use kvm_bench_common::VmSpec;
use kvm_bench_common::defaults::{DEFAULT_HYPERVISOR_CALL_TIMEOUT_SECS, DOMAIN_NAME_PREFIX};
use kvm_bench_coordinator::hypervisor::{Hypervisor, VirshConfig, VirshHypervisor};
use kvm_bench_coordinator::orchestrator::{RunCoordinator, print_results_summary, write_results};
use kvm_bench_coordinator::parser::GenericParser;
use kvm_bench_coordinator::remote::SshSessions;
use kvm_bench_coordinator::RunConfig;
use tracing::{info, warn};

/// Exit status for a run stopped by Ctrl-C or its deadline
const EXIT_INTERRUPTED: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "kvm-bench")]
#[command(about = "VM performance benchmarking on KVM/QEMU")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

/// Arguments for the run command
#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Run configuration file (YAML, or JSON with a .json extension)
    #[arg(short, long, env = "KVM_BENCH_CONFIG")]
    config: PathBuf,

    /// Number of VMs benchmarked at the same time
    #[arg(long)]
    concurrency: Option<usize>,

    /// Whole-run deadline in seconds (0 disables it)
    #[arg(long)]
    run_timeout: Option<u64>,

    /// Output JSON file for results
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Comma-separated subset of the test matrix to run
    #[arg(long, value_delimiter = ',')]
    only: Vec<String>,

    /// Validate configuration and print the plan without creating VMs
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Benchmark every VM size in the test matrix
    Run(Box<RunArgs>),
    /// Find and remove kvm-bench domains left behind by crashed runs
    CleanupOrphans {
        /// libvirt connection URI
        #[arg(long, default_value = kvm_bench_common::defaults::DEFAULT_LIBVIRT_URI)]
        uri: String,

        /// Directory holding domain overlays and XML files
        #[arg(long, default_value = kvm_bench_common::defaults::DEFAULT_IMAGE_DIR)]
        image_dir: PathBuf,

        /// Actually delete domains (default is to list them)
        #[arg(long)]
        execute: bool,
    },
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            print_error(&e);
            std::process::exit(1);
        }
    }
}

/// Print error in a user-friendly way
fn print_error(e: &anyhow::Error) {
    use std::io::Write;
    let mut stderr = std::io::stderr();

    let _ = writeln!(stderr, "\n\x1b[1;31mError:\x1b[0m {e}");

    let mut source = e.source();
    while let Some(cause) = source {
        let _ = writeln!(stderr, "  \x1b[33mCaused by:\x1b[0m {cause}");
        source = cause.source();
    }
}

async fn run() -> Result<i32> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    match args.command {
        Command::Run(run_args) => run_benchmarks(*run_args).await,
        Command::CleanupOrphans {
            uri,
            image_dir,
            execute,
        } => {
            cleanup_orphans(uri, image_dir, execute).await?;
            Ok(0)
        }
    }
}

async fn run_benchmarks(args: RunArgs) -> Result<i32> {
    let mut config = RunConfig::load(&args.config)?;
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(run_timeout) = args.run_timeout {
        config.deadlines.run_secs = run_timeout;
    }
    if args.output.is_some() {
        config.output = args.output;
    }
    config.only(&args.only)?;
    config.validate()?;
    let specs = config.matrix_specs()?;

    if args.dry_run {
        print_run_plan(&config, &specs);
        return Ok(0);
    }
    config.validate_hypervisor()?;

    let hypervisor = Arc::new(VirshHypervisor::new(
        config.hypervisor.clone(),
        Duration::from_secs(config.deadlines.hypervisor_call_secs),
    ));
    let coordinator = RunCoordinator::from_config(
        &config,
        hypervisor,
        Arc::new(SshSessions::new()),
        Arc::new(GenericParser),
    );
    info!(run_id = %coordinator.run_id(), config = %args.config.display(), "Run configured");

    let cancel = coordinator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run and tearing down VMs");
            cancel.cancel();
        }
    });

    let report = coordinator.execute(&specs).await;

    print_results_summary(&report);
    if let Some(path) = &config.output {
        write_results(path, &report)?;
    }

    Ok(if report.status.is_interrupted() {
        EXIT_INTERRUPTED
    } else {
        0
    })
}

fn print_run_plan(config: &RunConfig, specs: &[VmSpec]) {
    println!("\n=== Dry Run ===\n");

    let mut vms = Table::new();
    vms.load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["VM Spec", "vCPUs", "Memory (MiB)", "Disk (GiB)", "NIC", "Disk Bus/Cache/IO"]);
    for spec in specs {
        vms.add_row(vec![
            Cell::new(&spec.id),
            Cell::new(spec.vcpus),
            Cell::new(spec.memory_mb),
            Cell::new(spec.disk_gb),
            Cell::new(&spec.network.model),
            Cell::new(format!(
                "{}/{}/{}",
                spec.storage.bus, spec.storage.cache, spec.storage.io
            )),
        ]);
    }
    println!("{vms}");

    let mut steps = Table::new();
    steps
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["#", "Benchmark", "Output", "Timeout (s)", "Attempts", "Command"]);
    for (i, step) in config.benchmarks.iter().enumerate() {
        steps.add_row(vec![
            Cell::new(i + 1),
            Cell::new(&step.name),
            Cell::new(step.output),
            Cell::new(step.timeout_secs),
            Cell::new(step.max_attempts),
            Cell::new(&step.command),
        ]);
    }
    println!("{steps}");

    println!(
        "\nConcurrency: {}  Run deadline: {}  Ready deadline: {}s",
        config.concurrency,
        config
            .deadlines
            .run()
            .map_or_else(|| "none".to_string(), |d| format!("{}s", d.as_secs())),
        config.deadlines.ready_secs
    );
}

async fn cleanup_orphans(uri: String, image_dir: PathBuf, execute: bool) -> Result<()> {
    let hypervisor = VirshHypervisor::new(
        VirshConfig {
            uri,
            image_dir,
            ..VirshConfig::default()
        },
        Duration::from_secs(DEFAULT_HYPERVISOR_CALL_TIMEOUT_SECS),
    );

    let domains = hypervisor
        .list_domains(&format!("{DOMAIN_NAME_PREFIX}-"))
        .await?;
    if domains.is_empty() {
        println!("No kvm-bench domains found.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_header(vec!["Domain", "State", "Address", "Action"]);

    let mut failures = 0usize;
    for domain in &domains {
        let (state, address) = match hypervisor.describe(domain).await {
            Ok(info) => (info.state.to_string(), info.ip_address.unwrap_or_default()),
            Err(e) => (format!("unknown ({e})"), String::new()),
        };

        let action = if execute {
            let stopped = hypervisor.stop(domain).await;
            let removed = match stopped {
                Ok(()) => hypervisor.undefine(domain).await,
                Err(e) => Err(e),
            };
            match removed {
                Ok(()) => "removed".to_string(),
                Err(e) if e.is_not_found() => "already gone".to_string(),
                Err(e) => {
                    failures += 1;
                    warn!(domain = %domain, error = %e, "Failed to remove orphaned domain");
                    format!("failed: {e}")
                }
            }
        } else {
            "would remove".to_string()
        };

        table.add_row(vec![domain.clone(), state, address, action]);
    }

    println!("{table}");
    if !execute {
        println!("\nRe-run with --execute to remove these domains.");
    }
    if failures > 0 {
        anyhow::bail!("{failures} domain(s) could not be removed");
    }
    Ok(())
}
