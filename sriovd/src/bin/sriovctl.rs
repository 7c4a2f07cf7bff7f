use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use sriovd::rpc::{AllocateRequest, RpcClient};

const DEFAULT_DAEMON_ADDR: &str = "127.0.0.1:50051";

/// Remote client for the sriovd daemon
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// daemon address
    #[arg(short, long, default_value = DEFAULT_DAEMON_ADDR)]
    address: String,

    /// output format (table, json)
    #[arg(short, long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List pool devices with their VFs
    List,
    /// Show per-pool allocation status
    Status,
    /// Allocate VFs from a PF's pools
    Allocate {
        /// PF PCI address (e.g. 0000:3b:00.0)
        pf_pci: String,

        /// number of VFs to allocate
        #[arg(short, long, default_value_t = 1)]
        count: u32,

        /// NUMA hint (accepted, not honored by the allocator)
        #[arg(long, default_value = "")]
        numa: String,

        /// required feature (repeatable; accepted, not honored)
        #[arg(long)]
        required_feature: Vec<String>,

        /// dry-run flag (accepted, not honored)
        #[arg(long)]
        dry_run: bool,
    },
    /// Release previously allocated VFs by synthetic key
    Release {
        /// VF keys of the form <pfPCI>-vf<index>
        vf_keys: Vec<String>,
    },
    /// Administratively mask a VF
    Mask {
        vf_key: String,

        /// reason recorded with the mask
        #[arg(short, long, default_value = "")]
        reason: String,
    },
    /// Clear an administrative mask
    Unmask { vf_key: String },
    /// List pool names
    Pools,
    /// Show the frozen configuration of one pool
    PoolConfig { name: String },
    /// Dump the full daemon snapshot as JSON
    Dump,
    /// Trigger a device rescan
    Refresh,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let mut client = RpcClient::connect(&cli.address).await?;
    let json = cli.format == "json";

    match cli.command {
        Commands::List => {
            let devices = client.list_devices().await?;
            if json {
                return print_json(&devices);
            }
            println!(
                "{:<24} | {:<10} | {:<9} | {:<6} | {}",
                "VF Key", "Pool", "Allocated", "Masked", "PF"
            );
            println!("{}", "=".repeat(80));
            for pf in &devices.pfs {
                for vf in &pf.vfs {
                    println!(
                        "{:<24} | {:<10} | {:<9} | {:<6} | {}",
                        vf.vf_key, vf.pool, vf.allocated, vf.masked, vf.pf_pci
                    );
                }
            }
        }
        Commands::Status => {
            let status = client.get_status().await?;
            if json {
                return print_json(&status);
            }
            println!(
                "{:<12} | {:>5} | {:>9} | {:>6} | {:>4} | {:>6}",
                "Pool", "Total", "Allocated", "Masked", "Free", "Free%"
            );
            println!("{}", "=".repeat(60));
            for pool in &status.pools {
                println!(
                    "{:<12} | {:>5} | {:>9} | {:>6} | {:>4} | {:>5.1}%",
                    pool.name, pool.total, pool.allocated, pool.masked, pool.free,
                    pool.percent_free
                );
            }
        }
        Commands::Allocate {
            pf_pci,
            count,
            numa,
            required_feature,
            dry_run,
        } => {
            let response = client
                .allocate_vfs(AllocateRequest {
                    pf_pci,
                    count,
                    numa,
                    required_features: required_feature,
                    dry_run,
                })
                .await?;
            if json {
                return print_json(&response);
            }
            println!("{}", response.message);
            for vf in &response.vfs {
                println!("  {} (pool {})", vf.vf_key, vf.pool);
            }
        }
        Commands::Release { vf_keys } => {
            let response = client.release_vfs(vf_keys).await?;
            if json {
                return print_json(&response);
            }
            println!("{}", response.message);
            for key in &response.released {
                println!("  {key}");
            }
        }
        Commands::Mask { vf_key, reason } => {
            let ack = client.mask_vf(vf_key, reason).await?;
            if json {
                return print_json(&ack);
            }
            println!("{}", ack.message);
            if !ack.success {
                std::process::exit(1);
            }
        }
        Commands::Unmask { vf_key } => {
            let ack = client.unmask_vf(vf_key).await?;
            if json {
                return print_json(&ack);
            }
            println!("{}", ack.message);
        }
        Commands::Pools => {
            let pools = client.list_pools().await?;
            if json {
                return print_json(&pools);
            }
            for name in &pools.pools {
                println!("{name}");
            }
        }
        Commands::PoolConfig { name } => {
            let config = client.get_pool_config(name).await?;
            if json {
                return print_json(&config);
            }
            println!("name:              {}", config.name);
            println!("pf_pci:            {}", config.pf_pci);
            println!("vf_range:          {}", config.vf_range);
            println!("mask:              {}", config.mask);
            println!("mask_reason:       {}", config.mask_reason);
            println!("required_features: {}", config.required_features.join(", "));
            println!("numa:              {}", config.numa);
        }
        Commands::Dump => {
            let dump = client.dump_interfaces().await?;
            // the payload is already JSON; print it either way
            println!("{}", dump.json);
        }
        Commands::Refresh => {
            let ack = client.refresh_devices().await?;
            if json {
                return print_json(&ack);
            }
            println!("{}", ack.message);
            if !ack.success {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
