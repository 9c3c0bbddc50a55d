use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use env_logger::Builder;
use log::{info, LevelFilter};

mod api;
mod checks;
mod flows;
mod hostapi;
mod report;
mod ssh;

#[derive(Parser, Debug)]
#[command(
    name = "gwb",
    version,
    about = "Gwbench Pool Orchestrator CLI",
    long_about = "A command-line tool that drives gateway appliance pool instances through \
                  their claim, upgrade, validate and release lifecycle for CI."
)]
struct Cli {
    /// Path to the pool topology file
    #[arg(
        short = 'p',
        long = "pool",
        value_name = "FILE",
        default_value = "pool.toml"
    )]
    pool: PathBuf,

    /// Path of the step-level trace log
    #[arg(long = "log-file", value_name = "FILE", default_value = "gwb.log")]
    log_file: PathBuf,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reserve a pool instance and bring its device to a registered state
    Claim(ClaimArgs),
    /// Release a pool instance and revert it to its golden image
    Release(ReleaseArgs),
    /// Run the post-registration validation checks
    Validate(ValidateArgs),
    /// Print the pool instance bound to a controller, or a free one
    Find,
}

#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Device name, as declared in the pool topology and on the controller
    #[arg(long = "device-name", value_name = "NAME")]
    pub name: String,

    /// Device API hostname or IP
    #[arg(long = "device-host", value_name = "HOST")]
    pub host: String,

    /// Device API username
    #[arg(long = "device-username", value_name = "USER")]
    pub username: String,

    /// Device API password
    #[arg(long = "device-password", value_name = "PASSWORD")]
    pub password: String,
}

#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Controller hostname or IP
    #[arg(long = "controller-host", value_name = "HOST")]
    pub host: String,

    /// Controller username
    #[arg(long = "controller-username", value_name = "USER")]
    pub username: String,

    /// Controller password
    #[arg(long = "controller-password", value_name = "PASSWORD")]
    pub password: String,
}

#[derive(Args, Debug)]
pub struct ClaimArgs {
    #[command(flatten)]
    pub device: DeviceArgs,

    #[command(flatten)]
    pub controller: ControllerArgs,

    /// Software version to upgrade the device to
    #[arg(long = "version", value_name = "VERSION")]
    pub version: String,
}

#[derive(Args, Debug)]
pub struct ReleaseArgs {
    #[command(flatten)]
    pub device: DeviceArgs,

    #[command(flatten)]
    pub controller: ControllerArgs,

    /// Golden snapshot to revert to (defaults to the current snapshot)
    #[arg(long = "snapshot", value_name = "NAME")]
    pub snapshot: Option<String>,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub controller: ControllerArgs,

    /// Gateway name of the device on the controller
    #[arg(long = "device-name", value_name = "NAME")]
    pub device_name: String,

    /// Device API hostname or IP
    #[arg(long = "device-host", value_name = "HOST")]
    pub device_host: String,

    /// Device API port, if not 443
    #[arg(long = "device-api-port", value_name = "PORT")]
    pub device_api_port: Option<u16>,

    /// Device API username
    #[arg(long = "device-username", value_name = "USER")]
    pub device_username: String,

    /// Device API password
    #[arg(long = "device-password", value_name = "PASSWORD")]
    pub device_password: String,

    /// Device management shell SSH username
    #[arg(long = "device-ssh-username", value_name = "USER")]
    pub device_ssh_username: String,

    /// Device management shell SSH password
    #[arg(long = "device-ssh-password", value_name = "PASSWORD")]
    pub device_ssh_password: String,

    /// Device SSH port
    #[arg(long = "device-ssh-port", value_name = "PORT", default_value_t = 22)]
    pub device_ssh_port: u16,

    /// Transit VPC ID
    #[arg(long = "vpc-id", value_name = "ID")]
    pub vpc_id: String,

    /// Name of the site-to-cloud connection attached to the device
    #[arg(long = "conn-name", value_name = "NAME")]
    pub conn_name: String,

    /// Number of site-to-cloud tunnels expected once converged
    #[arg(long = "expected-tunnels", value_name = "COUNT")]
    pub expected_tunnels: u32,

    /// Spoke VM hostname or IP
    #[arg(long = "spoke-host", value_name = "HOST")]
    pub spoke_host: String,

    /// Spoke SSH username
    #[arg(long = "spoke-username", value_name = "USER", default_value = "ubuntu")]
    pub spoke_username: String,

    /// PEM private key for the spoke VM
    #[arg(long = "spoke-key", value_name = "FILE")]
    pub spoke_key: PathBuf,

    /// On-premises address probed from the spoke
    #[arg(long = "onprem-ip", value_name = "ADDR")]
    pub onprem_ip: String,

    /// Terminal PASS/FAIL artifact path
    #[arg(long = "result", value_name = "FILE", default_value = "result.txt")]
    pub result: PathBuf,

    /// Structured per-step report path
    #[arg(long = "report", value_name = "FILE", default_value = "result.json")]
    pub report: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The full step-level trace always goes to the log file; stdout stays
    // reserved for the terminal status and `find` output.
    let log_file = std::fs::File::create(&cli.log_file)
        .with_context(|| format!("failed to create log file {:?}", cli.log_file))?;
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    Builder::new()
        .filter(None, level)
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .init();

    match cli.command {
        // gwb claim --device-name ... --controller-host ... --version ...
        Commands::Claim(args) => {
            info!(
                "claiming {} for controller {}",
                args.device.name, args.controller.host
            );
            flows::run_claim(&cli.pool, &args).await?;
            println!(
                "{} claimed and registered with {}",
                args.device.name, args.controller.host
            );
        }

        // gwb release --device-name ... [--snapshot ...]
        Commands::Release(args) => {
            info!("releasing {}", args.device.name);
            flows::run_release(&cli.pool, &args).await?;
            println!("{} released", args.device.name);
        }

        // gwb validate --device-name ... --conn-name ... --expected-tunnels ...
        Commands::Validate(args) => {
            info!("validating {}", args.device_name);
            let verdict = flows::run_validate(&args).await?;
            println!("{verdict}");
        }

        // gwb find  (reads the JSON trigger from stdin)
        Commands::Find => {
            flows::run_find(&cli.pool).await?;
        }
    }

    Ok(())
}
