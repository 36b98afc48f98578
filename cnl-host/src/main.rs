// cnl: fetch named objects over a TCP face, or serve a file as a segmented or versioned object.

mod config;
mod face;
mod serve;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cnl_core::producer::ProducerStore;
use cnl_core::Name;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "cnl", version, about = "Fetch and serve named objects")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Command {
    /// Fetch an object from the configured face and write it out.
    Fetch {
        /// Object name, e.g. /demo/doc.
        name: Name,
        /// Discover the latest version and fetch that.
        #[arg(long)]
        versioned: bool,
        /// Write to this file instead of stdout.
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Publish a file under a prefix and answer interests for it.
    Serve {
        prefix: Name,
        file: PathBuf,
        /// Publish as version N of a generalized object, with a `_meta` packet.
        #[arg(short = 'n', long = "version-number")]
        version: Option<u64>,
        /// Content type recorded in `_meta`.
        #[arg(long, default_value = "application/octet-stream", requires = "version")]
        content_type: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cnl=info,cnl_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cfg = config::load();
    cfg.validate().context("invalid configuration")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Command::Fetch {
                name,
                versioned,
                out,
            } => {
                let bytes = tokio::select! {
                    r = face::fetch(&cfg, name, versioned) => r?,
                    r = shutdown_signal() => {
                        r?;
                        anyhow::bail!("interrupted");
                    }
                };
                match out {
                    Some(path) => std::fs::write(&path, &bytes)
                        .with_context(|| format!("write {}", path.display()))?,
                    None => std::io::stdout().write_all(&bytes)?,
                }
                Ok(())
            }
            Command::Serve {
                prefix,
                file,
                version,
                content_type,
            } => {
                let bytes = std::fs::read(&file)
                    .with_context(|| format!("read {}", file.display()))?;
                let mut store = ProducerStore::new();
                let published = match version {
                    Some(v) => store.publish_object(
                        &prefix,
                        Some(v),
                        &bytes,
                        &content_type,
                        cfg.segment_size,
                        Some(cfg.freshness_ms),
                    )?,
                    None => store.publish(&prefix, None, &bytes, cfg.segment_size, Some(cfg.freshness_ms)),
                };
                info!(name = %published, packets = store.len(), "published");
                let port = cfg.listen_port;
                tokio::spawn(async move {
                    if let Err(e) = serve::run_producer(Arc::new(store), port).await {
                        error!(error = %e, "producer stopped");
                    }
                });
                shutdown_signal().await?;
                info!("shutting down");
                Ok(())
            }
        }
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::error::ErrorKind;

    use super::*;

    fn parse(line: &str) -> Result<Command, clap::Error> {
        Cli::try_parse_from(line.split_whitespace()).map(|cli| cli.command)
    }

    #[test]
    fn parses_fetch() {
        let cmd = parse("cnl fetch /demo/doc --versioned --out doc.bin").unwrap();
        assert_eq!(
            cmd,
            Command::Fetch {
                name: "/demo/doc".parse().unwrap(),
                versioned: true,
                out: Some(PathBuf::from("doc.bin")),
            }
        );
    }

    #[test]
    fn parses_serve_with_version() {
        let cmd = parse("cnl serve /demo/doc ./doc.bin -n 7 --content-type text/plain").unwrap();
        assert_eq!(
            cmd,
            Command::Serve {
                prefix: "/demo/doc".parse().unwrap(),
                file: PathBuf::from("./doc.bin"),
                version: Some(7),
                content_type: "text/plain".into(),
            }
        );
    }

    #[test]
    fn rejects_incomplete_commands() {
        assert_eq!(
            parse("cnl fetch").unwrap_err().kind(),
            ErrorKind::MissingRequiredArgument
        );
        assert!(parse("cnl serve /demo/doc").is_err());
        assert_eq!(
            parse("cnl serve /demo/doc f -n x").unwrap_err().kind(),
            ErrorKind::ValueValidation
        );
        assert!(parse("cnl serve /demo/doc f --content-type text/plain").is_err());
        assert_eq!(parse("cnl --version").unwrap_err().kind(), ErrorKind::DisplayVersion);
    }

    #[test]
    fn bad_names_are_rejected_while_parsing() {
        assert_eq!(
            parse("cnl fetch /demo/%zz").unwrap_err().kind(),
            ErrorKind::ValueValidation
        );
    }
}
