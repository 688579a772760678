use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use common::{Command, MixerStatus, Response};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "vmixctl")]
#[command(about = "Live video mixer control", long_about = None)]
#[command(version)]
struct Cli {
    /// IPC socket path (defaults to $XDG_RUNTIME_DIR/vmix.sock)
    #[arg(long, env = "VMIX_SOCKET")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fade the media of a slot onto its output
    Show {
        /// Media slot id
        slot: u32,
    },

    /// Switch the controller to another bank of media buttons
    Bank {
        bank: u8,
    },

    /// Turn looping on or off for a slot
    Loop {
        slot: u32,

        #[arg(value_enum)]
        mode: Toggle,
    },

    /// Set the crossfade duration for subsequent fades
    FadeTime {
        /// Duration in milliseconds
        ms: u64,
    },

    /// Query daemon status, outputs and the source pool
    Query,

    /// Ping the daemon to check if it's running
    Ping,

    /// Kill the running daemon
    Kill,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Show { slot } => Command::ShowMedia { slot },
        Commands::Bank { bank } => Command::SetBank { bank },
        Commands::Loop { slot, mode } => Command::SetLooping {
            slot,
            looping: matches!(mode, Toggle::On),
        },
        Commands::FadeTime { ms } => Command::SetFadeTime { ms },
        Commands::Query => Command::Query,
        Commands::Ping => Command::Ping,
        Commands::Kill => Command::Kill,
    };

    let socket_path = cli.socket.unwrap_or_else(common::get_socket_path);
    match send_command(&socket_path, command).await {
        Ok(response) => {
            handle_response(response);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("\nIs the daemon running? Try starting it with: vmixd");
            std::process::exit(1);
        }
    }
}

async fn send_command(socket_path: &std::path::Path, command: Command) -> Result<Response> {
    let stream = UnixStream::connect(socket_path).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // Send command
    let command_json = serde_json::to_string(&command)?;
    writer.write_all(command_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    // Read response
    let mut response_line = String::new();
    reader.read_line(&mut response_line).await?;

    let response: Response = serde_json::from_str(&response_line)?;
    Ok(response)
}

fn handle_response(response: Response) {
    match response {
        Response::Ok => {
            println!("✓ Success");
        }
        Response::Pong => {
            println!("✓ Daemon is running");
        }
        Response::Shown { output, pool_index } => {
            println!("✓ Fading in on output {} (source {})", output, pool_index);
        }
        Response::Error(e) => {
            eprintln!("✗ Error: {}", e);
            std::process::exit(1);
        }
        Response::Status(status) => print_status(&status),
    }
}

fn print_status(status: &MixerStatus) {
    println!("Daemon Status:");
    println!("  Version: {}", status.version);
    println!("  Uptime: {}s", status.uptime_secs);

    println!("  Outputs:");
    for output in &status.outputs {
        let show = |id: Option<usize>| id.map_or_else(|| "black".to_string(), |i| format!("#{}", i));
        println!(
            "    {}: {} -> {} (mix {:.2}){}",
            output.index,
            show(output.from),
            show(output.to),
            output.mix_value,
            if output.fading { " fading" } else { "" }
        );
    }

    println!("  Sources:");
    for entry in &status.pool {
        let slot = entry
            .media_slot
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        print!(
            "    #{} {:<10} {:<8} slot {:<4} frames {}",
            entry.index, entry.kind, entry.state, slot, entry.frames_presented
        );
        match &entry.status {
            Some(reason) => println!("  ({})", reason),
            None => println!(),
        }
    }

    let controller = &status.controller;
    println!(
        "  Bank {}: {} active",
        controller.bank,
        controller.active_count()
    );
    for (button, state) in controller.media.iter().enumerate() {
        if *state != common::SlotState::Empty {
            println!("    button {:>2}: {:?}", button, state);
        }
    }
}
