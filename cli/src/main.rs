use std::io::Write;
use std::net::SocketAddr;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Builder;
use log::{debug, LevelFilter};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use igs_rs::api::compute::VmStatusFilter;
use igs_rs::api::control::{Request, Response};
use igs_rs::api::storage::{DiskInfo, PartitionInfo};
use igs_rs::error::ControlError;
use igs_tcp_control_socket_client::TcpControlSocketClient;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(
    name = "igs",
    version,
    about = "IGS dataplane shell",
    long_about = "A command-line interface for managing the virtual machines and storage of an IGS dataplane."
)]
struct Cli {
    /// Address of the dataplane control socket
    #[arg(
        short = 'a',
        long = "addr",
        value_name = "ADDR",
        default_value = "127.0.0.1:50051"
    )]
    addr: SocketAddr,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(flatten)]
    Remote(RemoteCommand),

    /// Read commands interactively
    Shell,
}

/// A line typed into the interactive shell.
#[derive(Parser, Debug)]
#[command(name = "igs", no_binary_name = true)]
struct ShellLine {
    #[command(subcommand)]
    command: ShellCommand,
}

#[derive(Subcommand, Debug)]
enum ShellCommand {
    #[command(flatten)]
    Remote(RemoteCommand),

    /// Leave the shell
    #[command(alias = "quit")]
    Exit,
}

#[derive(Subcommand, Debug, PartialEq)]
enum RemoteCommand {
    /// Manage virtual machines
    Vm {
        #[command(subcommand)]
        vm_command: VmCommands,
    },
    /// Manage the storage pool
    Disk {
        #[command(subcommand)]
        disk_command: DiskCommands,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
enum VmCommands {
    /// List VMs
    List {
        /// One of all, down, live, stopped, running
        #[arg(default_value = "all")]
        filter: VmStatusFilter,
    },
    /// Create a new VM
    Create,
    /// Tear down a VM and delete all of its files
    Delete { vm_name: String },
    /// Boot a VM
    Start { vm_name: String },
    /// Pause a running VM
    Stop { vm_name: String },
    /// Continue a paused VM
    Resume { vm_name: String },
    /// Ask the guest to power off
    Shutdown { vm_name: String },
    /// Query the hypervisor for the VM's run state
    Status { vm_name: String },
    /// Show the address leased to the VM
    Ip { vm_name: String },
    /// Show the address reported by the guest agent
    GuestIp { vm_name: String },
    /// Attach to the VM's serial console (Ctrl-C to detach)
    Console { vm_name: String },
}

#[derive(Subcommand, Debug, PartialEq)]
enum DiskCommands {
    /// List all host disks
    List,
    /// List disks not yet part of the pool
    Free,
    /// List disks partitioned for the pool
    Pool,
    /// Partition a free disk into equally sized pool partitions
    Add {
        /// Index into the list of free disks
        disk_index: usize,
        /// Size of each partition in GB
        partition_size_gb: u64,
    },
    /// Wipe a pool disk, detaching its partitions from all VMs
    Remove {
        /// Index into the list of pool disks
        disk_index: usize,
    },
    /// List partitions attached to a VM
    Vm { vm_name: String },
    /// Attach a free pool partition to a VM
    Attach { vm_name: String },
    /// Detach a partition (path or label) from a VM
    Detach {
        vm_name: String,
        partition_name: String,
    },
}

impl RemoteCommand {
    /// The serial console takes over the connection, every other command is
    /// a single request.
    fn console_vm(&self) -> Option<&str> {
        match self {
            RemoteCommand::Vm {
                vm_command: VmCommands::Console { vm_name },
            } => Some(vm_name),
            _ => None,
        }
    }

    fn to_request(&self) -> Option<Request> {
        let request = match self {
            RemoteCommand::Vm { vm_command } => match vm_command {
                VmCommands::List { filter } => Request::ListVms { filter: *filter },
                VmCommands::Create => Request::CreateVm,
                VmCommands::Delete { vm_name } => Request::DeleteVm {
                    vm_name: vm_name.clone(),
                },
                VmCommands::Start { vm_name } => Request::StartVm {
                    vm_name: vm_name.clone(),
                },
                VmCommands::Stop { vm_name } => Request::StopVm {
                    vm_name: vm_name.clone(),
                },
                VmCommands::Resume { vm_name } => Request::ResumeVm {
                    vm_name: vm_name.clone(),
                },
                VmCommands::Shutdown { vm_name } => Request::ShutdownVm {
                    vm_name: vm_name.clone(),
                },
                VmCommands::Status { vm_name } => Request::GetVmStatus {
                    vm_name: vm_name.clone(),
                },
                VmCommands::Ip { vm_name } => Request::GetVmIp {
                    vm_name: vm_name.clone(),
                },
                VmCommands::GuestIp { vm_name } => Request::GetGuestIp {
                    vm_name: vm_name.clone(),
                },
                VmCommands::Console { .. } => return None,
            },
            RemoteCommand::Disk { disk_command } => match disk_command {
                DiskCommands::List => Request::ListDisks,
                DiskCommands::Free => Request::ListFreeDisks,
                DiskCommands::Pool => Request::ListPoolDisks,
                DiskCommands::Add {
                    disk_index,
                    partition_size_gb,
                } => Request::AddDisk {
                    disk_index: *disk_index,
                    partition_size_gb: *partition_size_gb,
                },
                DiskCommands::Remove { disk_index } => Request::RemoveDisk {
                    disk_index: *disk_index,
                },
                DiskCommands::Vm { vm_name } => Request::ListVmDisks {
                    vm_name: vm_name.clone(),
                },
                DiskCommands::Attach { vm_name } => Request::AttachDiskToVm {
                    vm_name: vm_name.clone(),
                },
                DiskCommands::Detach {
                    vm_name,
                    partition_name,
                } => Request::DetachDiskFromVm {
                    vm_name: vm_name.clone(),
                    partition_name: partition_name.clone(),
                },
            },
        };
        Some(request)
    }
}

fn format_error(err: &ControlError) -> String {
    format!("{}: {}", err.kind.summary(), err.description)
}

fn print_disks(disks: &[DiskInfo]) {
    if disks.is_empty() {
        println!("(no disks)");
        return;
    }
    println!("{:<6} {:<16} {:>10} {:>10} {:>11}", "INDEX", "DISK", "SIZE", "FREE", "PARTITIONS");
    for (index, disk) in disks.iter().enumerate() {
        println!(
            "{:<6} {:<16} {:>8}GB {:>8}GB {:>11}",
            index,
            disk.name.display(),
            disk.size_bytes / GIB,
            disk.free_space_gb,
            disk.num_partitions
        );
    }
}

fn print_partitions(partitions: &[PartitionInfo]) {
    if partitions.is_empty() {
        println!("(no partitions)");
        return;
    }
    println!("{:<16} {:<12} {:>10} {:<16}", "PARTITION", "LABEL", "SIZE", "DISK");
    for partition in partitions {
        println!(
            "{:<16} {:<12} {:>8}GB {:<16}",
            partition.name.display(),
            partition.label,
            partition.size_bytes / GIB,
            partition.disk.display()
        );
    }
}

fn print_response(response: Response) {
    match response {
        Response::VmNames { vm_names } if vm_names.is_empty() => println!("(no VMs)"),
        Response::VmNames { vm_names } => {
            for vm_name in vm_names {
                println!("{}", vm_name);
            }
        }
        Response::VmName { vm_name } => println!("{}", vm_name),
        Response::VmStatus { status } => println!("{}", status),
        Response::VmIp { ip_address } => println!("{}", ip_address),
        Response::SerialConsoleReady { vm_name } => println!("Serial console of {} ready", vm_name),
        Response::Disks { disks } => print_disks(&disks),
        Response::Partitions { partitions } => print_partitions(&partitions),
        Response::Partition { partition } => print_partitions(&[partition]),
        Response::Done => println!("OK"),
        other => println!("{:?}", other),
    }
}

async fn run_request(client: &TcpControlSocketClient, request: Request) -> Result<()> {
    debug!("Sending request {:?}", request);
    match client.request(request).await? {
        Ok(response) => {
            print_response(response);
            Ok(())
        }
        Err(e) => Err(anyhow!(format_error(&e))),
    }
}

async fn console(client: TcpControlSocketClient, vm_name: &str) -> Result<()> {
    let console = client
        .open_serial_console(vm_name)
        .await?
        .map_err(|e| anyhow!(format_error(&e)))?;

    eprintln!(
        "Connected to serial console of {}. Press Ctrl-C to detach.",
        console.vm_name
    );

    let (mut console_rx, mut console_tx) = console.stream.into_split();
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(&console.pending)
        .await
        .context("Writing to stdout")?;
    stdout.flush().await.context("Writing to stdout")?;

    let mut stdin = tokio::io::stdin();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => (),
        res = tokio::io::copy(&mut stdin, &mut console_tx) => {
            res.context("Forwarding input to the serial console")?;
        }
        res = tokio::io::copy(&mut console_rx, &mut stdout) => {
            res.context("Receiving serial console output")?;
            eprintln!("\nSerial console closed by the dataplane.");
        }
    }

    eprintln!("\nDetached from serial console of {}.", vm_name);
    Ok(())
}

/// Execute a command, returning the client for further use. Opening the
/// serial console consumes the connection, in which case a new one is
/// established afterwards.
async fn execute(
    addr: SocketAddr,
    client: TcpControlSocketClient,
    command: &RemoteCommand,
) -> (TcpControlSocketClient, Result<()>) {
    if let Some(vm_name) = command.console_vm() {
        let res = console(client, vm_name).await;
        return match TcpControlSocketClient::new(addr).await {
            Ok(client) => (client, res),
            Err(e) => {
                // Without a connection the shell cannot continue:
                eprintln!("{:#}", e);
                std::process::exit(1);
            }
        };
    }

    let res = match command.to_request() {
        Some(request) => run_request(&client, request).await,
        None => Err(anyhow!("Unsupported command: {:?}", command)),
    };
    (client, res)
}

async fn shell(addr: SocketAddr) -> Result<()> {
    let mut client = TcpControlSocketClient::new(addr).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("igs> ");
        std::io::stdout().flush().context("Writing to stdout")?;

        let Some(line) = lines.next_line().await.context("Reading from stdin")? else {
            // EOF (Ctrl-D)
            println!();
            break;
        };

        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }

        let command = match ShellLine::try_parse_from(words) {
            Ok(ShellLine { command }) => command,
            Err(e) => {
                // Includes --help output, which clap reports as an error:
                let _ = e.print();
                continue;
            }
        };

        match command {
            ShellCommand::Exit => break,
            ShellCommand::Remote(remote) => {
                let (next_client, res) = execute(addr, client, &remote).await;
                client = next_client;
                if let Err(e) = res {
                    eprintln!("{:#}", e);
                }
            }
        }
    }

    client.shutdown().await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        Builder::new().filter(None, LevelFilter::Debug).init();
    } else {
        Builder::new().filter(None, LevelFilter::Warn).init();
    }

    match cli.command {
        Commands::Shell => shell(cli.addr).await,
        Commands::Remote(command) => {
            let client = TcpControlSocketClient::new(cli.addr).await?;
            if let Some(vm_name) = command.console_vm() {
                return console(client, vm_name).await;
            }

            let request = command
                .to_request()
                .ok_or_else(|| anyhow!("Unsupported command: {:?}", command))?;
            let res = run_request(&client, request).await;
            client.shutdown().await?;
            res
        }
    }
}
