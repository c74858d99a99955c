use std::path::PathBuf;

use clap::Parser;
use playground_core::config;
use playground_daemon::{InstanceConfig, LocalInstaller};
use playground_process::runtime_files::DAEMON_LOG_NAME;
use playground_proto::ServiceKind;

#[derive(Debug, Parser)]
#[command(name = "playground-daemon", version, about = "Runs one local playground cluster")]
struct Args {
    #[arg(long)]
    tag: String,
    /// Defaults to `<base>/<tag>`.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Command server port; 0 picks a free one.
    #[arg(long, default_value_t = 0)]
    port: u16,
    #[arg(long, default_value = "nightly")]
    version: String,
    #[arg(long)]
    bin_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 1)]
    pd: u32,
    #[arg(long, default_value_t = 1)]
    tikv: u32,
    #[arg(long, default_value_t = 1)]
    tidb: u32,
    #[arg(long, default_value_t = 0)]
    tiflash: u32,
    #[arg(long, default_value_t = 0)]
    tiproxy: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| config::base_data_dir().join(&args.tag));
    let instance = InstanceConfig {
        tag: args.tag.clone(),
        data_dir: data_dir.clone(),
        port: args.port,
        version: args.version.clone(),
        boot: vec![
            (ServiceKind::Pd, args.pd),
            (ServiceKind::Tikv, args.tikv),
            (ServiceKind::Tidb, args.tidb),
            (ServiceKind::Tiflash, args.tiflash),
            (ServiceKind::Tiproxy, args.tiproxy),
        ],
        stop_grace: config::stop_grace(),
    };

    // daemon.log belongs to whoever holds the claim.
    let claim = match playground_daemon::claim_instance(&instance).await {
        Ok(claim) => claim,
        Err(err) => {
            eprintln!("Error: {}", config::format_error_chain(&err));
            std::process::exit(1);
        }
    };

    let appender = tracing_appender::rolling::never(&data_dir, DAEMON_LOG_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();

    let bin_dir = args.bin_dir.clone().unwrap_or_else(config::component_bin_dir);
    let installer = LocalInstaller::new(bin_dir);
    tracing::info!(bin_dir = %installer.bin_dir().display(), "using local components");

    let out = Box::new(std::io::stdout());
    let res = playground_daemon::run_claimed(claim, instance, installer, out).await;
    if let Err(err) = &res {
        tracing::error!(error = %config::format_error_chain(err), "playground failed");
    }
    drop(guard);
    if let Err(err) = res {
        eprintln!("Error: {}", config::format_error_chain(&err));
        std::process::exit(1);
    }
    Ok(())
}
