use std::path::PathBuf;

use clap::{Parser, Subcommand};

use proxy_control::secret::{Key, SecretBox};
use proxy_control::topology::Certificate;

#[derive(Parser)]
#[command(name = "proxy-keys")]
#[command(about = "Key and certificate sealing tool for the proxy control plane", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new box key (hex)
    GenKey,
    /// Print the fingerprint stored in envelopes sealed with a key
    Fingerprint {
        #[arg(long, env = "PROXY_BOX_KEY")]
        box_key: String,
    },
    /// Seal a PEM certificate and private key for hosts/<id>/cert
    SealCert {
        #[arg(long, env = "PROXY_BOX_KEY")]
        box_key: String,
        #[arg(long)]
        cert: PathBuf,
        #[arg(long)]
        key: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::GenKey => {
            println!("{}", Key::generate().to_hex());
        }
        Commands::Fingerprint { box_key } => {
            println!("{}", Key::from_hex(&box_key)?.fingerprint());
        }
        Commands::SealCert { box_key, cert, key } => {
            let secrets = SecretBox::new(&Key::from_hex(&box_key)?);
            let certificate = Certificate {
                cert: std::fs::read_to_string(cert)?,
                key: std::fs::read_to_string(key)?,
            };
            println!("{}", certificate.seal(&secrets)?);
        }
    }

    Ok(())
}
