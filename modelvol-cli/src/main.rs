//! Operator CLI for the modelvol dynamic mount control socket.
//!
//! Runs from inside a published dynamic root volume: the volume's own
//! `status.json` names the volume, and `csi/csi.sock` is the control
//! socket. Mount, unmount, inspect, and list models without touching the
//! orchestrator.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use modelvol::api::MountRequest;
use modelvol::client::DynamicClient;
use modelvol::status::Status;

#[derive(Parser)]
#[command(name = "modelvol", version, about = "Manage model mounts of a dynamic volume")]
struct Cli {
    /// The mounted dynamic volume directory.
    #[arg(long, default_value = "/mnt/models", global = true)]
    workdir: PathBuf,

    /// Log verbosity when RUST_LOG is not set.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount a model by reference under a new mount id.
    Mount {
        #[arg(long)]
        reference: String,
        #[arg(long)]
        mount_id: String,
        #[arg(long)]
        check_disk_quota: bool,
        #[arg(long)]
        exclude_model_weights: bool,
        /// Gitignore-style patterns of files to drop after fetch. Repeatable.
        #[arg(long = "exclude-file-pattern")]
        exclude_file_patterns: Vec<String>,
    },
    /// Unmount a model by mount id.
    Umount {
        #[arg(long)]
        mount_id: String,
    },
    /// Show the status of one mount.
    Status {
        #[arg(long)]
        mount_id: String,
    },
    /// List every mount of this volume.
    List,
}

struct VolumeInfo {
    volume_name: String,
    client: DynamicClient,
}

fn volume_info(workdir: &PathBuf) -> Result<VolumeInfo> {
    let status_path = workdir.join("status.json");
    let data = std::fs::read(&status_path)
        .with_context(|| format!("read status file: {}", status_path.display()))?;
    let status: Status = serde_json::from_slice(&data)
        .with_context(|| format!("unmarshal status file: {}", status_path.display()))?;

    let sock_path = workdir.join("csi").join("csi.sock");
    Ok(VolumeInfo {
        volume_name: status.volume_name,
        client: DynamicClient::new(sock_path),
    })
}

fn print_mounts(statuses: &[Status]) {
    println!("{:<40} {:<16} {}", "MOUNT ID", "STATE", "REFERENCE");
    for status in statuses {
        let state = status
            .state
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40} {:<16} {}",
            status.mount_id, state, status.reference
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    modelvol::logging::init_logging(&cli.log_level);

    let info = volume_info(&cli.workdir)?;

    match cli.command {
        Command::Mount {
            reference,
            mount_id,
            check_disk_quota,
            exclude_model_weights,
            exclude_file_patterns,
        } => {
            let request = MountRequest {
                mount_id: mount_id.clone(),
                reference,
                check_disk_quota,
                exclude_model_weights,
                exclude_file_patterns,
            };
            info.client
                .create_mount(&info.volume_name, &request)
                .await
                .context("create mount")?;
            println!("{mount_id}");
        }
        Command::Umount { mount_id } => {
            info.client
                .delete_mount(&info.volume_name, &mount_id)
                .await
                .context("delete mount")?;
            println!("{mount_id}");
        }
        Command::Status { mount_id } => {
            let status = info
                .client
                .get_mount(&info.volume_name, &mount_id)
                .await
                .context("get mount")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::List => {
            let statuses = info
                .client
                .list_mounts(&info.volume_name)
                .await
                .context("list mounts")?;
            print_mounts(&statuses);
        }
    }

    Ok(())
}
