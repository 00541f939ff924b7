//! kait-hook - hook client for the agent runtime
//!
//! Spawned by the agent with one event on stdin as JSON. Stamps the event
//! kind from its argument, attaches the bearer token, and POSTs to the
//! daemon. Always exits 0: observation must never break the agent's tool
//! loop.

use clap::Parser;
use kait::config::KaitConfig;
use std::io::Read;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "kait-hook", version, about = "Forward one agent hook event to kaitd")]
struct Cli {
    /// Event kind: pre_tool, post_tool, post_tool_failure, or user_prompt
    kind: String,

    /// Daemon endpoint override
    #[arg(long)]
    url: Option<String>,

    /// Seconds to wait for the daemon before giving up
    #[arg(long, default_value_t = 2)]
    timeout_s: u64,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = forward(&cli) {
        // Never propagate failure into the agent; just leave a trace.
        eprintln!("kait-hook: {:#}", e);
    }
}

fn forward(cli: &Cli) -> anyhow::Result<()> {
    let mut body = String::new();
    std::io::stdin().read_to_string(&mut body)?;

    let mut event: serde_json::Value = serde_json::from_str(body.trim())?;
    let object = event
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("event must be a JSON object"))?;
    object.insert(
        "kind".to_string(),
        serde_json::Value::String(cli.kind.clone()),
    );
    if !object.contains_key("source") {
        object.insert(
            "source".to_string(),
            serde_json::Value::String("observe".to_string()),
        );
    }

    let config = KaitConfig::load(None).unwrap_or_default();
    let url = cli
        .url
        .clone()
        .unwrap_or_else(|| format!("http://{}:{}/events", config.daemon.bind, config.daemon.port));
    let token = kait::ingest::resolve_token(&config, &config.paths())?;

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(cli.timeout_s))
        .build()?;
    let response = client
        .post(&url)
        .bearer_auth(token)
        .header("content-type", "application/json")
        .body(event.to_string())
        .send()?;

    if !response.status().is_success() {
        anyhow::bail!("daemon returned {}", response.status());
    }
    Ok(())
}
