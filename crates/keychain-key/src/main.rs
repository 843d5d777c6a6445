use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use keychain_key::{ContextBinder, ContextSlots, Padding, SoftStore, report};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PaddingArg {
    Pkcs1,
    Sslv23,
    None,
    Oaep,
    X931,
    Pss,
}

impl From<PaddingArg> for Padding {
    fn from(arg: PaddingArg) -> Self {
        match arg {
            PaddingArg::Pkcs1 => Padding::Pkcs1,
            PaddingArg::Sslv23 => Padding::SslV23,
            PaddingArg::None => Padding::None,
            PaddingArg::Oaep => Padding::Pkcs1Oaep,
            PaddingArg::X931 => Padding::X931,
            PaddingArg::Pss => Padding::Pkcs1Pss,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Attach the identity and print its certificate subject and key size
    Show,
    /// Attach the identity and sign a pre-image through the installed key
    Sign {
        #[clap(long)]
        payload_hex: String,
        #[clap(long, value_enum, default_value = "pkcs1")]
        padding: PaddingArg,
    },
    /// List the identities in the store
    List,
}

#[derive(Parser)]
struct Args {
    /// Store manifest (JSON)
    #[clap(long, env = "KEYCHAIN_STORE")]
    store: PathBuf,
    /// Identity descriptor, e.g. "CN=test-client" or "label:test-client"
    #[clap(long, env = "KEYCHAIN_IDENTITY")]
    identity: Option<String>,
    /// Allow the store to prompt while unlocking
    #[clap(long)]
    interactive: bool,
    #[clap(subcommand)]
    command: Command,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let store = Arc::new(SoftStore::open(&args.store)?);

    if let Command::List = args.command {
        for (label, subject) in store.entries() {
            println!("{label}\t{subject}");
        }
        return Ok(());
    }

    let descriptor = args
        .identity
        .as_deref()
        .context("an identity descriptor is required (--identity or KEYCHAIN_IDENTITY)")?;
    let mut slots = ContextSlots::new();
    ContextBinder::new(store.clone())
        .interactive(args.interactive)
        .attach(&mut slots, descriptor)
        .inspect_err(|_| drain_errors())
        .with_context(|| format!("attaching identity `{descriptor}`"))?;

    let (Some(certificate), Some(key)) = (slots.certificate(), slots.private_key()) else {
        bail!("context is missing its certificate or private key");
    };

    match args.command {
        Command::Show => {
            println!("subject: {}", certificate.subject());
            println!("key size: {} bits", key.size() * 8);
            println!("method: {}", key.method_name());
        }
        Command::Sign {
            payload_hex,
            padding,
        } => {
            let payload = hex::decode(payload_hex.trim()).context("payload is not valid hex")?;
            let mut signature = vec![0u8; key.size()];
            let written = key
                .private_encrypt(&payload, &mut signature, padding.into())
                .inspect_err(|_| drain_errors())
                .context("signing failed")?;
            println!("{}", hex::encode(&signature[..written]));
        }
        Command::List => {}
    }

    drop(slots);
    tracing::debug!(
        references = store.outstanding_references(),
        allocations = store.outstanding_allocations(),
        "store released"
    );
    Ok(())
}

fn drain_errors() {
    while let Some(record) = report::get_error() {
        eprintln!("{record}");
    }
}
