//! valkey-cluster-pipeline - run commands against a cluster in one pipeline
//!
//! Each trailing argument is one command line; all of them are recorded
//! into a single pipeline, synced once, and printed in order.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use valkey_cluster_pipeline::config::{CliArgs, ClientConfig};
use valkey_cluster_pipeline::{ClusterClient, CommandError, Reply};

fn setup_logging(verbose: bool, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// One printed result
#[derive(Serialize)]
struct CommandOutput {
    command: String,
    ok: bool,
    result: serde_json::Value,
}

fn reply_to_json(reply: &Reply) -> serde_json::Value {
    use serde_json::Value;

    match reply {
        Reply::Ok => Value::String("OK".to_string()),
        Reply::Nil => Value::Null,
        Reply::Integer(n) => Value::from(*n),
        Reply::Boolean(b) => Value::Bool(*b),
        Reply::Text(s) => Value::String(s.clone()),
        Reply::Bytes(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
        Reply::Array(items) => Value::Array(items.iter().map(reply_to_json).collect()),
        Reply::Map(pairs) => Value::Object(
            pairs
                .iter()
                .map(|(k, v)| {
                    (
                        String::from_utf8_lossy(k).into_owned(),
                        Value::String(String::from_utf8_lossy(v).into_owned()),
                    )
                })
                .collect(),
        ),
    }
}

/// valkey-cli style rendering
fn format_reply(reply: &Reply, indent: usize) -> String {
    match reply {
        Reply::Ok => "OK".to_string(),
        Reply::Nil => "(nil)".to_string(),
        Reply::Integer(n) => format!("(integer) {}", n),
        Reply::Boolean(b) => format!("(integer) {}", u8::from(*b)),
        Reply::Text(s) => s.clone(),
        Reply::Bytes(b) => format!("\"{}\"", String::from_utf8_lossy(b)),
        Reply::Array(items) if items.is_empty() => "(empty array)".to_string(),
        Reply::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let pad = if i == 0 { String::new() } else { " ".repeat(indent) };
                format!("{}{}) {}", pad, i + 1, format_reply(item, indent + 3))
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Reply::Map(pairs) => format_reply(
            &Reply::Array(
                pairs
                    .iter()
                    .flat_map(|(k, v)| [Reply::Bytes(k.clone()), Reply::Bytes(v.clone())])
                    .collect(),
            ),
            indent,
        ),
    }
}

type CommandResult = std::result::Result<Reply, CommandError>;

fn json_report(lines: &[Vec<String>], results: &[CommandResult]) -> serde_json::Result<String> {
    let outputs: Vec<CommandOutput> = lines
        .iter()
        .zip(results)
        .map(|(line, result)| {
            let (ok, value) = match result {
                Ok(reply) => (true, reply_to_json(reply)),
                Err(e) => (false, serde_json::Value::String(describe(e))),
            };
            CommandOutput {
                command: line.join(" "),
                ok,
                result: value,
            }
        })
        .collect();
    serde_json::to_string_pretty(&outputs)
}

fn text_report(results: &[CommandResult]) -> String {
    results
        .iter()
        .map(|result| match result {
            Ok(reply) => format_reply(reply, 0),
            Err(e) => format!("(error) {}", describe(e)),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn run() -> Result<()> {
    let args = CliArgs::parse_args();
    setup_logging(args.verbose, args.quiet);

    let config = ClientConfig::from_cli(&args).context("Configuration error")?;
    let lines = args.command_lines();
    if lines.is_empty() {
        anyhow::bail!("no commands given (e.g. valkey-cluster-pipeline -h host \"SET k v\" \"GET k\")");
    }

    let mut client = ClusterClient::connect(config).context("Failed to connect to cluster")?;
    let mut pipeline = client.pipeline();

    for line in &lines {
        let (name, rest) = line
            .split_first()
            .context("empty command line")?;
        let rest: Vec<&[u8]> = rest.iter().map(|a| a.as_bytes()).collect();
        pipeline
            .send_command(name.as_bytes(), &rest)
            .with_context(|| format!("Failed to queue '{}'", line.join(" ")))?;
    }

    let results = pipeline.sync_and_return_all().context("Pipeline failed")?;
    info!(
        "Pipeline done: {} commands, {} MOVED, {} ASK",
        results.len(),
        pipeline.moved_count(),
        pipeline.asked_count()
    );

    if args.json {
        println!("{}", json_report(&lines, &results)?);
    } else {
        println!("{}", text_report(&results));
    }

    drop(pipeline);
    client.close();
    Ok(())
}

fn describe(error: &CommandError) -> String {
    match error {
        CommandError::Server(msg) => msg.clone(),
        other => other.to_string(),
    }
}

fn main() {
    if let Err(e) = run() {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
