//! simlink gRPC server
//!
//! Loads model snapshots, matches ports, raises enrichment decisions and
//! serves them to remote resolvers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal;
use tonic::transport::Server;

use simlink::broker::BrokerConfig;
use simlink::project::{ModelSnapshot, ProjectRegistry};
use simlink::topology::TopologyConfig;
use simlink::transport::DecisionServiceImpl;

/// Server configuration
struct Config {
    /// Address to bind to
    addr: SocketAddr,
    /// Model snapshots to serve, one project each
    models: Vec<PathBuf>,
    /// Port matching distance used when a model does not set its own
    epsilon: f64,
    /// Upper bound on decisions per bunch
    max_bunch_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            models: Vec::new(),
            epsilon: TopologyConfig::default().epsilon,
            max_bunch_size: None,
        }
    }
}

fn value_of<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(value) => value.as_str(),
        None => {
            eprintln!("error: {flag} requires a value");
            std::process::exit(1);
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                let raw = value_of(&args, i, "--port");
                let port: u16 = raw.parse().unwrap_or_else(|_| {
                    eprintln!("error: invalid port number: {raw}");
                    std::process::exit(1);
                });
                config.addr.set_port(port);
                i += 2;
            }
            "--model" | "-m" => {
                config.models.push(PathBuf::from(value_of(&args, i, "--model")));
                i += 2;
            }
            "--epsilon" | "-e" => {
                let raw = value_of(&args, i, "--epsilon");
                config.epsilon = raw.parse().unwrap_or_else(|_| {
                    eprintln!("error: invalid epsilon: {raw}");
                    std::process::exit(1);
                });
                i += 2;
            }
            "--max-bunch" => {
                let raw = value_of(&args, i, "--max-bunch");
                let size: usize = raw.parse().unwrap_or_else(|_| {
                    eprintln!("error: invalid bunch size: {raw}");
                    std::process::exit(1);
                });
                config.max_bunch_size = Some(size);
                i += 2;
            }
            "--help" | "-h" => {
                println!("simlink-server - serve pending decisions over gRPC");
                println!();
                println!("USAGE:");
                println!("    simlink-server [OPTIONS] --model <FILE>...");
                println!();
                println!("OPTIONS:");
                println!("    -p, --port <PORT>         Port to listen on [default: 50051]");
                println!("    -m, --model <FILE>        Model snapshot (JSON); repeatable");
                println!("    -e, --epsilon <DIST>      Port matching distance [default: 1.0]");
                println!("        --max-bunch <N>       Decisions per bunch [default: all]");
                println!("    -h, --help                Print help information");
                println!();
                println!("Log filtering follows RUST_LOG [default: info].");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    config
}

fn load_projects(config: &Config) -> Result<ProjectRegistry, Box<dyn std::error::Error>> {
    let registry = ProjectRegistry::new();
    let fallback = TopologyConfig {
        epsilon: config.epsilon,
    };
    let broker_config = BrokerConfig {
        max_bunch_size: config.max_bunch_size,
        ..BrokerConfig::default()
    };

    for path in &config.models {
        let snapshot = ModelSnapshot::load(path)?;
        let requirements = snapshot.requirements()?;
        let topology = snapshot.topology(fallback);
        let project = snapshot.into_project(broker_config.clone())?;
        let report = project.prepare(topology, &requirements)?;

        println!(
            "project {} ({}): {} connections, {} open decisions",
            project.id(),
            project.name(),
            report.topology.new_connections,
            report.raised.len()
        );
        registry.insert(project)?;
    }
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = parse_args();
    if config.models.is_empty() {
        eprintln!("error: at least one --model is required");
        std::process::exit(1);
    }

    println!("simlink server v{}", env!("CARGO_PKG_VERSION"));
    let registry = Arc::new(load_projects(&config)?);
    let svc = DecisionServiceImpl::new(registry).into_server();

    println!("Starting gRPC server on {}", config.addr);
    println!("Press Ctrl+C to stop");

    Server::builder()
        .add_service(svc)
        .serve_with_shutdown(config.addr, async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    println!("Shut down");
    Ok(())
}
