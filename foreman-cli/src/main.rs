//! foreman-cli: HTTP client for a running Foreman server
//!
//! # Subcommands
//! - `append --user <u> --thread <t> --value k=v ...`  append one whiteboard entry
//! - `tail --user <u> [--thread <t>] [--after <id>]`  follow the live stream (SSE)
//! - `checkpoint --user <u> --thread <t>`  show a thread's progress record
//! - `status`  show server health

use std::io::{BufRead, BufReader};

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8090";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "foreman-cli",
    version,
    about = "Append to and follow Foreman whiteboard streams"
)]
struct Cli {
    /// Foreman HTTP server URL (overrides FOREMAN_HTTP_URL env var)
    #[arg(long, env = "FOREMAN_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Append an entry to a user's whiteboard
    Append {
        #[arg(long)]
        user: String,

        #[arg(long)]
        thread: String,

        /// Field as key=value; values that parse as JSON keep their type
        #[arg(long = "value", short = 'v', value_parser = parse_field)]
        values: Vec<(String, serde_json::Value)>,
    },

    /// Follow new entries as they are appended
    Tail {
        #[arg(long)]
        user: String,

        /// Only show entries for this thread
        #[arg(long)]
        thread: Option<String>,

        /// Resume after this entry id instead of starting at now
        #[arg(long)]
        after: Option<String>,

        /// Print raw JSON frames, one per line
        #[arg(long)]
        json: bool,
    },

    /// Show the checkpoint for a thread
    Checkpoint {
        #[arg(long)]
        user: String,

        #[arg(long)]
        thread: String,
    },

    /// Show Foreman server status
    Status,
}

// ============================================================================
// Parsing helpers
// ============================================================================

/// Parses `key=value`. `n=3` becomes a number, `tag=calm` a string.
fn parse_field(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// One decoded server-sent event.
#[derive(Debug, Default, PartialEq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub data: String,
}

/// Line-oriented SSE decoder. Comment lines (keep-alives) are skipped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    current: SseFrame,
    has_data: bool,
}

impl SseDecoder {
    /// Feeds one line without its terminator. Returns a frame on the blank
    /// line that ends it.
    pub fn feed(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if !self.has_data {
                self.current = SseFrame::default();
                return None;
            }
            self.has_data = false;
            return Some(std::mem::take(&mut self.current));
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "id" => self.current.id = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.has_data = true;
            }
            _ => {}
        }
        None
    }
}

#[derive(Debug, Deserialize)]
pub struct EntryFrame {
    pub entry_id: String,
    pub thread_id: Option<String>,
    pub values: serde_json::Map<String, serde_json::Value>,
    pub timestamp: String,
}

/// `<timestamp> <entry id> [<thread>] <type> {values}`
pub fn format_frame(frame: &EntryFrame) -> String {
    let kind = frame
        .values
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("-");
    format!(
        "{} {} [{}] {} {}",
        frame.timestamp,
        frame.entry_id,
        frame.thread_id.as_deref().unwrap_or("-"),
        kind,
        serde_json::Value::Object(frame.values.clone())
    )
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client(timeout_secs: Option<u64>) -> anyhow::Result<reqwest::blocking::Client> {
    let mut builder = reqwest::blocking::Client::builder();
    builder = match timeout_secs {
        Some(secs) => builder.timeout(std::time::Duration::from_secs(secs)),
        None => builder.timeout(None),
    };
    Ok(builder.build()?)
}

fn fail_on_status(resp: reqwest::blocking::Response) -> reqwest::blocking::Response {
    if resp.status().is_success() {
        return resp;
    }
    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    eprintln!("foreman-cli: server returned {}: {}", status, body);
    std::process::exit(1);
}

fn do_append(
    server: &str,
    user: &str,
    thread: &str,
    values: Vec<(String, serde_json::Value)>,
) -> anyhow::Result<()> {
    if values.is_empty() {
        anyhow::bail!("at least one --value is required");
    }
    let url = format!("{}/wb/append", server);
    let body = serde_json::json!({
        "user_id": user,
        "thread_id": thread,
        "values": values.into_iter().collect::<serde_json::Map<_, _>>(),
    });

    let resp = match client(Some(10))?.post(&url).json(&body).send() {
        Ok(r) => fail_on_status(r),
        Err(e) => {
            eprintln!("foreman-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };
    let body: serde_json::Value = resp.json()?;
    println!("{}", body["id"].as_str().unwrap_or("?"));
    Ok(())
}

fn do_tail(
    server: &str,
    user: &str,
    thread: Option<&str>,
    after: Option<&str>,
    json_output: bool,
) -> anyhow::Result<()> {
    let url = format!("{}/wb/stream", server);
    let mut query = vec![("user_id", user)];
    if let Some(thread) = thread {
        query.push(("thread_id", thread));
    }
    if let Some(after) = after {
        query.push(("after", after));
    }

    let resp = match client(None)?.get(&url).query(&query).send() {
        Ok(r) => fail_on_status(r),
        Err(e) => {
            eprintln!("foreman-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    let mut decoder = SseDecoder::default();
    for line in BufReader::new(resp).lines() {
        let line = line?;
        let Some(frame) = decoder.feed(line.trim_end_matches('\r')) else {
            continue;
        };
        if json_output {
            println!("{}", frame.data);
            continue;
        }
        match serde_json::from_str::<EntryFrame>(&frame.data) {
            Ok(entry) => println!("{}", format_frame(&entry)),
            Err(e) => eprintln!("foreman-cli: skipping unreadable frame: {}", e),
        }
    }

    eprintln!("foreman-cli: stream closed by server");
    Ok(())
}

fn do_checkpoint(server: &str, user: &str, thread: &str) -> anyhow::Result<()> {
    let url = format!("{}/checkpoints/{}/{}", server, user, thread);
    let resp = match client(Some(10))?.get(&url).send() {
        Ok(r) => fail_on_status(r),
        Err(e) => {
            eprintln!("foreman-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    };
    let body: serde_json::Value = resp.json()?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let resp = client(Some(10))?.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            let orch = &body["orchestrator"];
            println!("Foreman server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:        {}", body["version"].as_str().unwrap_or("?"));
            println!("Log backend:    {}", body["log"].as_str().unwrap_or("?"));
            println!("Checkpoints:    {}", body["checkpoints"].as_str().unwrap_or("?"));
            println!("Decider:        {}", body["decider"].as_str().unwrap_or("?"));
            println!("Users:          {}", body["users"]);
            println!(
                "Processed:      {} (prompts {}, dispatches {}, dead-lettered {})",
                orch["processed"], orch["prompts"], orch["dispatches"], orch["dead_lettered"]
            );
            if let Some(err) = orch["last_error"].as_str() {
                println!("Last error:     {}", err);
            }
        }
        Ok(r) => {
            let status = r.status();
            eprintln!("foreman-cli: server unhealthy (HTTP {})", status);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("foreman-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Append {
            user,
            thread,
            values,
        } => do_append(&server, &user, &thread, values),
        Commands::Tail {
            user,
            thread,
            after,
            json,
        } => do_tail(&server, &user, thread.as_deref(), after.as_deref(), json),
        Commands::Checkpoint { user, thread } => do_checkpoint(&server, &user, &thread),
        Commands::Status => do_status(&server),
    };

    if let Err(e) = result {
        eprintln!("foreman-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ========================================================================
    // TEST 1: key=value keeps JSON types and falls back to strings
    // ========================================================================
    #[test]
    fn test_parse_field_types() {
        assert_eq!(parse_field("n=3").unwrap(), ("n".to_string(), json!(3)));
        assert_eq!(
            parse_field("type=prod.nudge").unwrap(),
            ("type".to_string(), json!("prod.nudge"))
        );
        assert_eq!(
            parse_field("meta={\"a\":1}").unwrap(),
            ("meta".to_string(), json!({"a": 1}))
        );
        // only the first '=' splits
        assert_eq!(
            parse_field("q=a=b").unwrap(),
            ("q".to_string(), json!("a=b"))
        );
    }

    // ========================================================================
    // TEST 2: malformed fields are rejected
    // ========================================================================
    #[test]
    fn test_parse_field_rejects_malformed() {
        assert!(parse_field("novalue").is_err());
        assert!(parse_field("=x").is_err());
    }

    // ========================================================================
    // TEST 3: SSE decoder assembles id + data and skips keep-alives
    // ========================================================================
    #[test]
    fn test_sse_decoder_frames() {
        let mut decoder = SseDecoder::default();
        let lines = [
            ": keep-alive",
            "",
            "id: 1700000000000-0",
            "data: {\"a\":1}",
            "",
            "data: first",
            "data: second",
            "",
        ];
        let frames: Vec<SseFrame> = lines.iter().filter_map(|l| decoder.feed(l)).collect();
        assert_eq!(
            frames,
            vec![
                SseFrame {
                    id: Some("1700000000000-0".into()),
                    data: "{\"a\":1}".into(),
                },
                SseFrame {
                    id: None,
                    data: "first\nsecond".into(),
                },
            ]
        );
    }

    // ========================================================================
    // TEST 4: human-readable frame line
    // ========================================================================
    #[test]
    fn test_format_frame() {
        let frame: EntryFrame = serde_json::from_value(json!({
            "entry_id": "5-0",
            "stream": "user:u1:wb",
            "user_id": "u1",
            "thread_id": "t1",
            "values": {"type": "prod.overrun"},
            "timestamp": "2026-02-23T10:00:00+00:00",
        }))
        .unwrap();
        assert_eq!(
            format_frame(&frame),
            "2026-02-23T10:00:00+00:00 5-0 [t1] prod.overrun {\"type\":\"prod.overrun\"}"
        );
    }
}
