use std::{io::Write, path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use playground_core::config;
use playground_ctl::{
    ClientContext, StartOptions, commands, daemon_binary, launcher, should_suggest_not_running,
};
use playground_process::runtime_files::DEFAULT_WAIT_TIMEOUT;
use playground_proto::ServiceKind;

#[derive(Debug, Parser)]
#[command(name = "playground", version, about = "Manage local playground clusters")]
struct Cli {
    /// Instance tag; optional when exactly one instance is running.
    #[arg(long, global = true)]
    tag: Option<String>,
    /// Instance directory; defaults to `<base>/<tag>`.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Start a new instance in the background.
    Start {
        #[arg(long, default_value = "nightly")]
        version: String,
        #[arg(long, default_value_t = 0)]
        port: u16,
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
        /// Seconds to wait for the command server.
        #[arg(long, default_value_t = DEFAULT_WAIT_TIMEOUT.as_secs())]
        timeout: u64,
    },
    /// Stop one instance and wait for it to exit.
    Stop {
        #[arg(long, default_value_t = DEFAULT_WAIT_TIMEOUT.as_secs())]
        timeout: u64,
    },
    /// Stop every running instance.
    StopAll {
        #[arg(long, default_value_t = DEFAULT_WAIT_TIMEOUT.as_secs())]
        timeout: u64,
    },
    /// List running instances.
    Ps,
    /// Show the services of one instance.
    Display,
    ScaleOut {
        #[arg(long)]
        service: ServiceKind,
        #[arg(long, default_value_t = 1)]
        count: u32,
        #[arg(long)]
        version: Option<String>,
    },
    ScaleIn {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        pid: Option<u32>,
    },
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let base = config::base_data_dir();
    let ctx = ClientContext {
        base: base.clone(),
        tag: cli.tag.clone(),
        data_dir: cli.data_dir.clone(),
    };
    let mut out = std::io::stdout();

    match cli.command {
        Cmd::Start {
            version,
            port,
            bin_dir,
            pd,
            tikv,
            tidb,
            tiflash,
            tiproxy,
            timeout,
        } => {
            let tag = match (cli.tag, &cli.data_dir) {
                (Some(tag), _) => tag,
                (None, Some(dir)) => dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                (None, None) => anyhow::bail!("start requires --tag or --data-dir"),
            };
            let opts = StartOptions {
                tag,
                data_dir: cli.data_dir,
                daemon_bin: daemon_binary()?,
                port,
                version,
                bin_dir,
                services: vec![
                    (ServiceKind::Pd, pd),
                    (ServiceKind::Tikv, tikv),
                    (ServiceKind::Tidb, tidb),
                    (ServiceKind::Tiflash, tiflash),
                    (ServiceKind::Tiproxy, tiproxy),
                ],
                ready_timeout: Duration::from_secs(timeout),
            };
            launcher::start(&base, &opts, &mut out).await?;
        }
        Cmd::Stop { timeout } => {
            commands::stop(&ctx, Duration::from_secs(timeout), &mut out).await?
        }
        Cmd::StopAll { timeout } => {
            commands::stop_all(&ctx, Duration::from_secs(timeout), out).await?
        }
        Cmd::Ps => commands::ps(&ctx, &mut out).await?,
        Cmd::Display => commands::display(&ctx, &mut out).await?,
        Cmd::ScaleOut {
            service,
            count,
            version,
        } => commands::scale_out(&ctx, service, count, version, &mut out).await?,
        Cmd::ScaleIn { name, pid } => commands::scale_in(&ctx, name, pid, &mut out).await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        let _ = std::io::stdout().flush();
        eprintln!("Error: {}", config::format_error_chain(&err));
        if should_suggest_not_running(&err) {
            eprintln!("check the tag or run \"playground ps\"");
        }
        std::process::exit(1);
    }
}
