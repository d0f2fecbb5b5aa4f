//! simlink resolver client
//!
//! Connects to a simlink server, selects a project and answers every pending
//! decision by cycling through the given candidate values.

use std::time::Duration;

use simlink::client::{Backoff, CyclingStrategy, DecisionClient, RetryPolicy};
use simlink::transport::RemoteSession;
use simlink::Value;

/// Client configuration
struct Config {
    addr: String,
    project: Option<String>,
    answers: Vec<Value>,
    delay: Duration,
    max_attempts: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "http://127.0.0.1:50051".to_string(),
            project: None,
            answers: Vec::new(),
            delay: Duration::from_millis(100),
            max_attempts: None,
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

/// Candidate values are JSON; anything else is taken as a plain string.
fn parse_answer(raw: &str) -> Value {
    serde_json::from_str::<serde_json::Value>(raw)
        .map_or_else(|_| Value::from(raw), Value::from)
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" | "-a" => {
                config.addr = value_of(&args, i, "--addr").to_string();
                i += 2;
            }
            "--project" | "-p" => {
                config.project = Some(value_of(&args, i, "--project").to_string());
                i += 2;
            }
            "--answer" => {
                config.answers.push(parse_answer(value_of(&args, i, "--answer")));
                i += 2;
            }
            "--delay-ms" => {
                let raw = value_of(&args, i, "--delay-ms");
                let ms: u64 = raw.parse().unwrap_or_else(|_| {
                    eprintln!("error: invalid delay: {raw}");
                    std::process::exit(1);
                });
                config.delay = Duration::from_millis(ms);
                i += 2;
            }
            "--max-attempts" => {
                let raw = value_of(&args, i, "--max-attempts");
                let attempts: u32 = raw.parse().unwrap_or_else(|_| {
                    eprintln!("error: invalid attempt count: {raw}");
                    std::process::exit(1);
                });
                config.max_attempts = Some(attempts);
                i += 2;
            }
            "--help" | "-h" => {
                println!("simlink-client - answer pending decisions of a simlink server");
                println!();
                println!("USAGE:");
                println!("    simlink-client --project <ID> --answer <JSON>... [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -a, --addr <URL>          Server address [default: http://127.0.0.1:50051]");
                println!("    -p, --project <ID>        Project id printed by the server");
                println!("        --answer <JSON>       Candidate value, tried in order; repeatable");
                println!("        --delay-ms <MS>       Pause after a rejected answer [default: 100]");
                println!("        --max-attempts <N>    Give up on a decision after N answers");
                println!("    -h, --help                Print help information");
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

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = parse_args();
    let Some(project) = config.project.as_deref() else {
        eprintln!("error: --project is required");
        std::process::exit(1);
    };
    if config.answers.is_empty() {
        eprintln!("error: at least one --answer is required");
        std::process::exit(1);
    }

    let mut session = RemoteSession::connect(config.addr.clone())?;
    let name = session.set_project(project)?;
    println!("Resolving decisions of '{name}'");

    let mut policy = RetryPolicy::default().with_backoff(Backoff::Fixed(config.delay));
    if let Some(attempts) = config.max_attempts {
        policy = policy.with_max_attempts(attempts);
    }
    let mut client = DecisionClient::new(CyclingStrategy::new(config.answers), policy);
    let report = client.run(&mut session)?;

    for (key, value) in &report.resolved {
        println!("{key} = {value}");
    }
    println!(
        "{} decisions resolved in {} bunches ({} answers sent)",
        report.resolved.len(),
        report.bunches,
        report.attempts
    );
    Ok(())
}
