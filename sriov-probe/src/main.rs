use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use sriov_probe::sysfs::{SriovCapacity, Sysfs};
use sriov_probe::{PciIdsIndex, parse_capabilities};
use std::path::PathBuf;

/// Inspect SR-IOV capable PCI network devices through sysfs
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// sysfs root (override for testing against a fake tree)
    #[arg(long, default_value = sriov_probe::sysfs::DEFAULT_SYS_ROOT)]
    sys_root: PathBuf,

    /// pci.ids database path
    #[arg(long, default_value = sriov_probe::pci_ids::DEFAULT_PCI_IDS_PATH)]
    pci_ids: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List SR-IOV capable PCI devices
    List {
        /// output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
    /// Map Physical Functions to their Virtual Functions
    VfMap {
        /// output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
    /// Walk the PCI capability list of one device
    Caps {
        /// PCI address (e.g. 0000:3b:00.0)
        pci: String,
    },
}

#[derive(Debug, Serialize)]
struct DeviceRow {
    pci: String,
    driver: String,
    iface: String,
    vendor: String,
    device: String,
    total_vfs: u32,
    num_vfs: u32,
}

#[derive(Debug, Serialize)]
struct VfMapRow {
    pf: String,
    vfs: Vec<(u32, String)>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    PciIdsIndex::init_global(&cli.pci_ids);
    let sysfs = Sysfs::new(&cli.sys_root);

    match cli.command {
        Commands::List { format } => run_list(&sysfs, &format),
        Commands::VfMap { format } => run_vf_map(&sysfs, &format),
        Commands::Caps { pci } => run_caps(&sysfs, &pci),
    }
}

fn sriov_devices(sysfs: &Sysfs) -> Result<Vec<(String, u32, u32)>> {
    let mut devices = Vec::new();
    for pci in sysfs.list_pci_devices()? {
        if let SriovCapacity::Capable { total_vfs, num_vfs } = sysfs.read_sriov_capacity(&pci) {
            devices.push((pci, total_vfs, num_vfs));
        }
    }
    Ok(devices)
}

fn run_list(sysfs: &Sysfs, format: &str) -> Result<()> {
    let ids = PciIdsIndex::global();
    let mut rows = Vec::new();

    for (pci, total_vfs, num_vfs) in sriov_devices(sysfs)? {
        let attrs = sysfs.read_device_attrs(&pci);
        let names = ids.resolve(
            &attrs.identity.vendor_id,
            &attrs.identity.device_id,
            &attrs.identity.subsystem_vendor_id,
            &attrs.identity.subsystem_device_id,
        );

        rows.push(DeviceRow {
            pci,
            driver: attrs.driver,
            iface: attrs.iface,
            vendor: names.vendor,
            device: names.device,
            total_vfs,
            num_vfs,
        });
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!(
        "{:<14} | {:<12} | {:<12} | {:>5} | {:>5} | {}",
        "PCI", "Driver", "Iface", "Total", "VFs", "Device"
    );
    println!("{}", "=".repeat(90));
    if rows.is_empty() {
        println!("(No SR-IOV capable devices found)");
        return Ok(());
    }
    for row in &rows {
        println!(
            "{:<14} | {:<12} | {:<12} | {:>5} | {:>5} | {} {}",
            row.pci, row.driver, row.iface, row.total_vfs, row.num_vfs, row.vendor, row.device
        );
    }
    Ok(())
}

fn run_vf_map(sysfs: &Sysfs, format: &str) -> Result<()> {
    let mut rows = Vec::new();
    for (pci, _, num_vfs) in sriov_devices(sysfs)? {
        if num_vfs == 0 {
            continue;
        }
        rows.push(VfMapRow {
            vfs: sysfs.enumerate_vfs(&pci),
            pf: pci,
        });
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{:<14} | {}", "PF", "VFs");
    println!("{}", "=".repeat(70));
    if rows.is_empty() {
        println!("(No PFs with enabled VFs found)");
        return Ok(());
    }
    for row in &rows {
        let vfs: Vec<String> = row
            .vfs
            .iter()
            .map(|(index, addr)| format!("vf{index}={addr}"))
            .collect();
        println!("{:<14} | {}", row.pf, vfs.join(" "));
    }
    Ok(())
}

fn run_caps(sysfs: &Sysfs, pci: &str) -> Result<()> {
    let config = sysfs.read_config_space(pci);
    if config.is_empty() {
        println!("(No config space readable for {pci})");
        return Ok(());
    }

    for cap in parse_capabilities(&config) {
        match cap.version {
            Some(version) => println!("0x{}  {} ({version})", cap.id, cap.name),
            None => println!("0x{}  {}", cap.id, cap.name),
        }
    }
    Ok(())
}
