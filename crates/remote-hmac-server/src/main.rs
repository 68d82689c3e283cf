//! Remote HMAC server entry point.

use std::path::PathBuf;

use remote_hmac_server::{HmacServer, ServerConfig, ServerResult};
use tracing::{error, info};

/// Command-line arguments.
struct Args {
    /// Path to configuration file.
    config: Option<PathBuf>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" | "-c" => {
                    config = args.next().map(PathBuf::from);
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("remote-hmac {}", remote_hmac_server::VERSION);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
            }
        }

        Self { config }
    }
}

fn print_help() {
    println!(
        r"Remote HMAC - batch HMAC-SHA256 remote function

USAGE:
    remote-hmac [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file (TOML or JSON)
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT VARIABLES:
    REMOTE_HMAC_LISTEN_ADDR       Address to bind (default: 0.0.0.0)
    REMOTE_HMAC_LISTEN_PORT       Port to listen on (default: 8080)
    REMOTE_HMAC_FUNCTION_PATH     Path batches are posted to (default: /)
    REMOTE_HMAC_ENGINE_MODE       parallel or sequential (default: parallel)
    REMOTE_HMAC_MAX_CONCURRENCY   Rows digested at once, 0 = CPU count (default: 0)
    REMOTE_HMAC_LOG_LEVEL         Log filter directive (default: info)
    REMOTE_HMAC_LOG_FORMAT        json or pretty (default: json)

EXAMPLES:
    remote-hmac --config /etc/remote-hmac/config.toml
    REMOTE_HMAC_LISTEN_PORT=9000 remote-hmac
"
    );
}

fn load_config(path: Option<PathBuf>) -> Result<ServerConfig, String> {
    let config = match path {
        Some(path) => ServerConfig::from_file(&path)
            .map_err(|e| format!("failed to load configuration from {}: {e}", path.display()))?,
        None => ServerConfig::default(),
    }
    .with_env_overrides();

    config
        .validate()
        .map_err(|e| format!("invalid configuration: {e}"))?;
    Ok(config)
}

fn init_telemetry(config: &ServerConfig) -> ServerResult<()> {
    remote_hmac_telemetry::init_telemetry(&config.telemetry_config())?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Logging is configured from the file, so errors before that go to stderr.
    let config = match load_config(args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_telemetry(&config) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    info!(
        version = remote_hmac_server::VERSION,
        listen_addr = %config.server.listen_addr,
        listen_port = config.server.listen_port,
        "starting remote HMAC server"
    );

    let server = match HmacServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
