//! Provisioning tool for the Latch lock table.
//!
//! Creates the DynamoDB table used by upload lockers, either on-demand or with
//! provisioned read/write capacity.

mod logging;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{error, info};

use latch_common::DEFAULT_REGION;
use latch_lock::{CapacityMode, LockerConfig, UploadLocker};

/// Command line arguments for the provisioning tool
#[derive(Debug, Parser)]
#[command(name = "latch-setup", version, about = "Create the DynamoDB lock table")]
struct Cli {
    /// DynamoDB table name
    #[arg(long = "table-name", env = "LATCH_TABLE_NAME")]
    table_name: String,
    /// AWS region
    #[arg(long = "region", default_value = DEFAULT_REGION)]
    region: String,
    /// Read capacity units for provisioned capacity (0 for on-demand)
    #[arg(long = "read-capacity-units", default_value_t = 0)]
    read_capacity_units: i64,
    /// Write capacity units for provisioned capacity (0 for on-demand)
    #[arg(long = "write-capacity-units", default_value_t = 0)]
    write_capacity_units: i64,
    /// Endpoint override, e.g. http://localhost:8000 for DynamoDB Local
    #[arg(long = "endpoint-url")]
    endpoint_url: Option<String>,
}

impl Cli {
    fn locker_config(&self) -> LockerConfig {
        LockerConfig {
            table_name: self.table_name.clone(),
            region: self.region.clone(),
            endpoint_url: self.endpoint_url.clone(),
            ..LockerConfig::default()
        }
    }
}

/// Both zero means on-demand; otherwise both must be positive
fn capacity_from_units(read_units: i64, write_units: i64) -> anyhow::Result<CapacityMode> {
    if read_units == 0 && write_units == 0 {
        return Ok(CapacityMode::OnDemand);
    }
    if read_units <= 0 || write_units <= 0 {
        bail!("For provisioned capacity, both read/write capacity units should be over 0.");
    }
    Ok(CapacityMode::Provisioned {
        read_units,
        write_units,
    })
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if cli.table_name.trim().is_empty() {
        bail!("Table name is required!");
    }
    let capacity = capacity_from_units(cli.read_capacity_units, cli.write_capacity_units)?;

    let locker = UploadLocker::from_config(&cli.locker_config())
        .await
        .context("Error initializing locker")?;

    info!(table = %cli.table_name, region = %cli.region, %capacity, "Creating lock table");
    locker
        .create_table(capacity)
        .await
        .context("Error creating DynamoDB Table")?;

    info!("DynamoDB Table ({}) is provisioning.", cli.table_name);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logging_guard = match logging::init_logging(&logging::LoggingConfig::from_env()) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("{}", e);
            None
        }
    };

    if let Err(e) = run(cli).await {
        if logging_guard.is_some() {
            error!("{:#}", e);
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}
