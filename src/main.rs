//! pinshare - Main Entry Point
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CLI Application                                │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │  server side:  keygen · fingerprint · serve                         ││
//! │  │  client side:  check · trust · untrust · upload                     ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                    │                                    │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │                    Trust Layer                                      ││
//! │  │  - Fingerprint confirmation       - Pinned certificate store        ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                    │                                    │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │                    TLS Layer (rustls)                               ││
//! │  │  - Probe verifier (any cert)      - Pinned verifier (one cert)      ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                    │                                    │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │                    HTTP Layer                                       ││
//! │  │  - reqwest multipart client       - axum + hyper server             ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use pinshare::config::Paths;
use pinshare::fingerprint::fingerprint_from_path;
use pinshare::server::{Server, ServerConfig};
use pinshare::tls::{certificates_exist, generate_server_cert, save_cert_and_key, ServerTlsConfig};
use pinshare::tofu::{Confirm, ExpectedFingerprint, TerminalPrompt, TlsProbe, TrustStatus, TrustVerifier};
use pinshare::transfer::TransferClient;
use pinshare::trust_store::{ServerIdentity, TrustStore};

/// pinshare
///
/// Share files over TLS with self-signed certificates pinned on first use.
#[derive(Parser)]
#[command(name = "pinshare")]
#[command(version)]
#[command(about = "File sharing over TLS with trust-on-first-use pinning", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration directory (key material and trusted certificates)
    #[arg(long, global = true, env = "PINSHARE_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Server host
    #[arg(long)]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "443")]
    port: u16,
}

impl Target {
    fn identity(&self) -> ServerIdentity {
        ServerIdentity::new(&self.host, self.port)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the server's self-signed certificate and key
    Keygen {
        /// Replace existing key material
        #[arg(long)]
        force: bool,
    },

    /// Print this server's certificate fingerprint
    Fingerprint,

    /// Start the file sharing server
    Serve {
        /// Address to bind to
        #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        bind: IpAddr,

        /// Port to listen on
        #[arg(short, long, default_value = "443")]
        port: u16,

        /// Directory to save uploaded files in
        #[arg(short, long, default_value = "uploads")]
        upload_dir: PathBuf,

        /// Generate a new self-signed certificate before starting
        #[arg(long)]
        gen_cert: bool,
    },

    /// Check that a server is reachable and whether it is trusted
    Check {
        #[command(flatten)]
        target: Target,
    },

    /// Pin a server's certificate after confirming its fingerprint
    Trust {
        #[command(flatten)]
        target: Target,

        /// Confirm non-interactively: accept only this fingerprint
        #[arg(long)]
        fingerprint: Option<String>,

        /// Replace an existing record for this server
        #[arg(long)]
        replace: bool,
    },

    /// Forget a pinned server
    Untrust {
        #[command(flatten)]
        target: Target,
    },

    /// Upload files to a trusted server
    Upload {
        #[command(flatten)]
        target: Target,

        /// Files to upload
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Every config picks ring explicitly; this covers anything that asks for the default
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let paths = Paths::resolve(cli.config_dir);

    match cli.command {
        Commands::Keygen { force } => run_keygen(&paths, force),
        Commands::Fingerprint => {
            println!("{}", fingerprint_from_path(&paths.cert_path)?);
            Ok(())
        }
        Commands::Serve {
            bind,
            port,
            upload_dir,
            gen_cert,
        } => run_server(&paths, SocketAddr::new(bind, port), upload_dir, gen_cert).await,
        Commands::Check { target } => run_check(&paths, &target.identity()).await,
        Commands::Trust {
            target,
            fingerprint,
            replace,
        } => run_trust(&paths, &target.identity(), fingerprint.as_deref(), replace).await,
        Commands::Untrust { target } => run_untrust(&paths, &target.identity()),
        Commands::Upload { target, paths: files } => {
            run_upload(&paths, &target.identity(), &files).await
        }
    }
}

fn trust_verifier(paths: &Paths) -> Result<TrustVerifier> {
    Ok(TrustVerifier::new(
        TrustStore::new(&paths.trust_dir),
        TlsProbe::new()?,
    ))
}

fn write_server_cert(paths: &Paths) -> Result<()> {
    let cert = generate_server_cert()?;
    save_cert_and_key(&cert.cert_pem, &cert.key_pem, &paths.cert_path, &paths.key_path)
}

fn run_keygen(paths: &Paths, force: bool) -> Result<()> {
    if certificates_exist(&paths.cert_path, &paths.key_path) && !force {
        bail!(
            "Key material already exists in {:?}; pass --force to replace it",
            paths.config_dir()
        );
    }

    info!("🔐 Generating self-signed certificate...");
    write_server_cert(paths)?;

    info!("✅ Certificate generated successfully!");
    info!("   Certificate: {:?}", paths.cert_path);
    info!("   Private key: {:?}", paths.key_path);
    info!("   Fingerprint: {}", fingerprint_from_path(&paths.cert_path)?);

    Ok(())
}

async fn run_server(paths: &Paths, bind: SocketAddr, upload_dir: PathBuf, gen_cert: bool) -> Result<()> {
    if gen_cert || !certificates_exist(&paths.cert_path, &paths.key_path) {
        info!("🔐 Generating new self-signed certificate...");
        write_server_cert(paths)?;
        info!("Certificates generated successfully!");
    }

    info!("🚀 Starting server on {}", bind);
    info!("Files will be stored in: {:?}", upload_dir);
    info!("Server fingerprint: {}", fingerprint_from_path(&paths.cert_path)?);

    let tls_config = ServerTlsConfig::from_files(&paths.cert_path, &paths.key_path)?;
    let server = Server::new(ServerConfig::new(bind, upload_dir, tls_config));
    server.run().await
}

async fn run_check(paths: &Paths, identity: &ServerIdentity) -> Result<()> {
    let verifier = trust_verifier(paths)?;
    let status = verifier.status(identity).await?;

    println!("Server is reachable at {}", identity);
    match &status {
        TrustStatus::Trusted { fingerprint } | TrustStatus::Untrusted { presented: fingerprint } => {
            println!("Server certificate fingerprint: {}", fingerprint);
        }
        TrustStatus::Changed { saved, presented } => {
            println!("Server certificate fingerprint: {}", presented);
            warn!("⚠️  The certificate changed since it was pinned ({})", saved);
        }
    }
    println!("{}", status_advice(&status));

    Ok(())
}

/// What the operator can do next; plain `trust` re-prompts for a changed certificate
fn status_advice(status: &TrustStatus) -> &'static str {
    match status {
        TrustStatus::Trusted { .. } => "This server is already trusted.",
        TrustStatus::Untrusted { .. } => {
            "This server is NOT trusted. Use `pinshare trust` to trust it."
        }
        TrustStatus::Changed { .. } => {
            "This server is NOT trusted. Run `pinshare trust` again only if you expected the change."
        }
    }
}

async fn run_trust(
    paths: &Paths,
    identity: &ServerIdentity,
    expected: Option<&str>,
    replace: bool,
) -> Result<()> {
    let verifier = trust_verifier(paths)?;
    let confirm: Box<dyn Confirm> = match expected {
        Some(fingerprint) => Box::new(ExpectedFingerprint::new(fingerprint)),
        None => Box::new(TerminalPrompt),
    };

    let record = if replace {
        verifier.retrust(identity, confirm.as_ref()).await?
    } else {
        verifier.trust(identity, confirm.as_ref()).await?
    };

    println!("Server trusted successfully! ({})", record.fingerprint);
    Ok(())
}

fn run_untrust(paths: &Paths, identity: &ServerIdentity) -> Result<()> {
    let store = TrustStore::new(&paths.trust_dir);
    if store.remove(identity)? {
        println!("Removed trust record for {}", identity);
    } else {
        println!("{} was not trusted", identity);
    }
    Ok(())
}

async fn run_upload(paths: &Paths, identity: &ServerIdentity, files: &[PathBuf]) -> Result<()> {
    let client = TransferClient::new(trust_verifier(paths)?).with_progress(true);
    let receipt = client.upload(identity, files).await?;

    println!("{} file(s) uploaded successfully!", receipt.files);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_certificate_advice_names_plain_trust() {
        let advice = status_advice(&TrustStatus::Changed {
            saved: "aa".into(),
            presented: "bb".into(),
        });
        assert!(advice.contains("`pinshare trust`"));
        assert!(!advice.contains("--replace"));
    }

    #[test]
    fn test_status_advice() {
        assert!(status_advice(&TrustStatus::Trusted { fingerprint: "aa".into() })
            .contains("already trusted"));
        assert!(status_advice(&TrustStatus::Untrusted { presented: "aa".into() })
            .contains("NOT trusted"));
    }

    #[test]
    fn test_cli_parses_trust_with_fingerprint() {
        let cli = Cli::try_parse_from([
            "pinshare", "trust", "--host", "files.example", "--port", "8443", "--fingerprint", "ab:cd",
        ])
        .unwrap();
        match cli.command {
            Commands::Trust { target, fingerprint, replace } => {
                assert_eq!(target.identity().to_string(), "files.example:8443");
                assert_eq!(fingerprint.as_deref(), Some("ab:cd"));
                assert!(!replace);
            }
            _ => panic!("expected trust"),
        }
    }
}
