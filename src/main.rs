use std::io::{Read, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use encfs_volume::{CreateMode, Volume};

#[derive(Parser)]
#[command(name = "encfs-volume", version = "1.0.0", about = "Operate an EncFS 6 compatible encrypted volume directly")]
struct Cli {
    /// Root directory of the encrypted volume
    #[arg(short, long, global = true)]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new volume descriptor at --root
    Init {
        /// Use the paranoia defaults (256-bit key, chained name IV, external IV chaining)
        #[arg(long)]
        paranoia: bool,
    },
    /// Print the volume's descriptor fields
    Info,
    /// List the plaintext names directly inside a directory
    Ls {
        #[arg(default_value = "")]
        dir: String,
    },
    /// Print the decrypted contents of a file
    Cat {
        path: String,
    },
    /// Write stdin as the decrypted contents of a file
    Put {
        path: String,
    },
    /// Rename a plaintext path (and re-key its file IV if external IV chaining is on)
    Rename {
        old: String,
        new: String,
    },
}

fn read_passphrase() -> std::io::Result<String> {
    eprint!("Passphrase: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { paranoia } => {
            let passphrase = read_passphrase()?;
            let mode = if paranoia { CreateMode::Paranoia } else { CreateMode::Standard };
            Volume::create_at(&cli.root, passphrase.as_bytes(), mode)?;
            println!("Created volume at {}", cli.root.display());
        }

        Commands::Info => {
            let passphrase = read_passphrase()?;
            let volume = Volume::unlock_at(&cli.root, passphrase.as_bytes())?;
            println!("Volume:        {}", cli.root.display());
            println!("Reverse mode:  {}", volume.is_reverse());
        }

        Commands::Ls { dir } => {
            let passphrase = read_passphrase()?;
            let volume = Volume::unlock_at(&cli.root, passphrase.as_bytes())?;
            let mut names = volume.list_dir(&dir)?;
            names.sort();
            for name in names {
                println!("{name}");
            }
        }

        Commands::Cat { path } => {
            let passphrase = read_passphrase()?;
            let volume = Volume::unlock_at(&cli.root, passphrase.as_bytes())?;
            let handle = volume.open(&path)?;
            let mut offset = 0u64;
            let mut buf = vec![0u8; 64 * 1024];
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            loop {
                let n = handle.read(offset, &mut buf)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
                offset += n as u64;
            }
        }

        Commands::Put { path } => {
            let passphrase = read_passphrase()?;
            let volume = Volume::unlock_at(&cli.root, passphrase.as_bytes())?;
            let mut data = Vec::new();
            std::io::stdin().read_to_end(&mut data)?;
            let handle = volume.open(&path)?;
            let _lock = volume.lock_path(&path);
            let current_size = volume.file_size_plain(&path)?;
            handle.set_length(current_size, 0)?;
            handle.write(0, 0, &data)?;
            println!("Wrote {} bytes to {path}", data.len());
        }

        Commands::Rename { old, new } => {
            let passphrase = read_passphrase()?;
            let volume = Volume::unlock_at(&cli.root, passphrase.as_bytes())?;
            volume.rename(&old, &new)?;
            println!("Renamed {old} -> {new}");
        }
    }

    Ok(())
}
