use notemirror_core::NodeClient;
use notemirrord::config::RunConfig;
use notemirrord::sync::coordinator::SyncCoordinator;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run { extra_roots: Vec<String> },
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut extra_roots = Vec::new();
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliMode::Help),
            other if other.starts_with('-') => anyhow::bail!("unknown argument: {other}"),
            id => extra_roots.push(id.to_string()),
        }
    }
    Ok(CliMode::Run { extra_roots })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let extra_roots = match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: notemirrord [ROOT_ID...]");
            println!("  Mirrors the configured root nodes into NOTEMIRROR_OUTPUT_DIR.");
            println!("  Root ids given as arguments are synced in addition to");
            println!("  those listed in NOTEMIRROR_ROOTS.");
            return Ok(());
        }
        CliMode::Run { extra_roots } => extra_roots,
    };

    let config = RunConfig::from_env()?;
    let mut roots = config.roots.clone();
    roots.extend(extra_roots);
    if roots.is_empty() {
        anyhow::bail!("no root nodes configured; set NOTEMIRROR_ROOTS or pass ids as arguments");
    }

    let client = match config.api_base_url.as_deref() {
        Some(base_url) => NodeClient::with_base_url(base_url, &config.token)?,
        None => NodeClient::new(&config.token)?,
    };
    let coordinator = SyncCoordinator::new(client, &config.output_root);

    let failed = coordinator.run(&roots, &config.options).await;
    if failed > 0 {
        anyhow::bail!("{failed} of {} root node(s) failed to sync", roots.len());
    }
    Ok(())
}
