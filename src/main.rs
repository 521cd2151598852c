mod cli;

use vodforge::{config, probe, server};

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "vodforge=trace,tower_http=debug".to_string()
        } else {
            "vodforge=debug,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::Probe { file, json } => probe_file(&file, cli.config.as_deref(), json),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("vodforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn start_server(host: String, port: u16, config_path: Option<&std::path::Path>) -> Result<()> {
    let mut config = config::load_config_or_default(config_path)?;

    // Override host/port from CLI if specified
    config.server.host = host;
    config.server.port = port;

    tracing::info!("Starting vodforge server");
    tracing::info!(
        "Server will listen on {}:{}",
        config.server.host,
        config.server.port
    );

    server::start_server(config).await
}

fn probe_file(file: &std::path::Path, config_path: Option<&std::path::Path>, json: bool) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;

    if !file.exists() {
        anyhow::bail!("Input file does not exist: {:?}", file);
    }

    let rt = tokio::runtime::Runtime::new()?;
    let info = rt.block_on(probe::probe_file(&config.transcode.ffprobe, file))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("File: {}", file.display());
        println!("Video: {} {}x{}", info.codec_name, info.width, info.height);
        println!("Duration: {:.3}s", info.duration.as_secs_f64());
        println!("Frame rate: {} fps", info.frame_rate);
        println!("Bit rate: {} bps", info.bit_rate);
        if info.rotation != 0 {
            println!("Rotation: {} degrees", info.rotation);
        }
    }

    Ok(())
}

fn validate_config(path: Option<&std::path::Path>) -> Result<()> {
    let config = config::load_config_or_default(path)?;
    println!(
        "Configuration OK ({} chunk seconds, goal {}..{})",
        config.transcode.chunk_duration_secs,
        config.transcode.goal_buffer_min,
        config.transcode.goal_buffer_max
    );
    Ok(())
}
