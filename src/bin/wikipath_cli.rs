//!
//! wikipath CLI binary
//! -------------------
//! Command-line client for a running wikipath server: submits a search to
//! `/find-path-stream` and prints the streamed events as they arrive.

use std::env;

use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;

fn print_usage(program: &str) {
    eprintln!(
        "Usage:\n  {program} --start <title> --end <title> [--server <url>] [--paths <1-5>] [--diversity <0.0-1.0>]\n\nFlags:\n  --server <url>           Server base URL (default: http://127.0.0.1:8080)\n  --start <title>          Start article title (required)\n  --end <title>            End article title (required)\n  -k, --paths <n>          Number of diverse paths to request (default: 1)\n  -d, --diversity <f>      Minimum Jaccard distance between paths (default: 0.3)\n  -h, --help               Show this help\n\nExamples:\n  {program} --start \"Graph theory\" --end \"Leonhard Euler\"\n  {program} --server http://127.0.0.1:8080 --start Tea --end Physics --paths 3"
    );
}

struct CliArgs {
    server: String,
    start: String,
    end: String,
    max_paths: usize,
    min_diversity: f64,
}

fn take_value<'a>(args: &'a [String], i: usize) -> Result<&'a String> {
    args.get(i + 1)
        .ok_or_else(|| anyhow!("flag {} expects a value", args[i]))
}

fn parse_args(program: &str, args: &[String]) -> Result<CliArgs> {
    let mut server = "http://127.0.0.1:8080".to_string();
    let mut start: Option<String> = None;
    let mut end: Option<String> = None;
    let mut max_paths: usize = 1;
    let mut min_diversity: f64 = 0.3;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--server" => {
                server = take_value(args, i)?.clone();
                i += 2;
            }
            "--start" => {
                start = Some(take_value(args, i)?.clone());
                i += 2;
            }
            "--end" => {
                end = Some(take_value(args, i)?.clone());
                i += 2;
            }
            "-k" | "--paths" => {
                max_paths = take_value(args, i)?.parse().context("--paths expects an integer")?;
                i += 2;
            }
            "-d" | "--diversity" => {
                min_diversity = take_value(args, i)?.parse().context("--diversity expects a float")?;
                i += 2;
            }
            "-h" | "--help" => {
                print_usage(program);
                std::process::exit(0);
            }
            other => {
                return Err(anyhow!("unknown flag: {}", other));
            }
        }
    }
    let start = start.ok_or_else(|| anyhow!("--start is required"))?;
    let end = end.ok_or_else(|| anyhow!("--end is required"))?;
    Ok(CliArgs { server, start, end, max_paths, min_diversity })
}

/// Render one decoded event line for the terminal.
fn print_event(v: &serde_json::Value) {
    match v.get("type").and_then(|t| t.as_str()) {
        Some("progress") => {
            println!(
                "  ... depth {}+{}, {} pages checked ({:.0}/s)",
                v.get("forward_depth").and_then(|x| x.as_u64()).unwrap_or(0),
                v.get("backward_depth").and_then(|x| x.as_u64()).unwrap_or(0),
                v.get("pages_checked").and_then(|x| x.as_u64()).unwrap_or(0),
                v.get("pages_per_second").and_then(|x| x.as_f64()).unwrap_or(0.0),
            );
        }
        Some("path_found") => {
            let hops: Vec<String> = v
                .get("path")
                .and_then(|p| p.as_array())
                .map(|arr| arr.iter().filter_map(|t| t.as_str()).map(str::to_string).collect())
                .unwrap_or_default();
            println!(
                "path #{}: {}",
                v.get("index").and_then(|x| x.as_u64()).unwrap_or(0),
                hops.join(" -> ")
            );
        }
        Some("complete") => {
            let n = v
                .get("paths")
                .and_then(|p| p.as_array())
                .map(|a| a.len())
                .unwrap_or(0);
            let partial = v
                .pointer("/stats/partial")
                .and_then(|x| x.as_bool())
                .unwrap_or(false);
            println!(
                "complete: {} path(s), {} pages checked in {}ms{}",
                n,
                v.pointer("/stats/pages_checked").and_then(|x| x.as_u64()).unwrap_or(0),
                v.pointer("/stats/elapsed_ms").and_then(|x| x.as_u64()).unwrap_or(0),
                if partial { " (partial)" } else { "" }
            );
        }
        Some("error") => {
            eprintln!(
                "error [{}]: {}",
                v.get("kind").and_then(|x| x.as_str()).unwrap_or("internal"),
                v.get("message").and_then(|x| x.as_str()).unwrap_or("")
            );
        }
        Some("keepalive") => {}
        _ => {
            println!("{}", v);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let argv: Vec<String> = env::args().collect();
    let program = argv.first().cloned().unwrap_or_else(|| "wikipath_cli".to_string());
    let cli = match parse_args(&program, &argv[1..]) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            print_usage(&program);
            std::process::exit(2);
        }
    };

    let client = reqwest::Client::new();
    let url = format!("{}/find-path-stream", cli.server.trim_end_matches('/'));
    let resp = client
        .post(&url)
        .json(&serde_json::json!({
            "start": cli.start,
            "end": cli.end,
            "max_paths": cli.max_paths,
            "min_diversity": cli.min_diversity,
        }))
        .send()
        .await
        .with_context(|| format!("connecting to {}", url))?;
    if !resp.status().is_success() {
        return Err(anyhow!("server returned HTTP {}", resp.status()));
    }

    // Decode the SSE body incrementally: frames are separated by a blank
    // line, each carrying one `data: <json>` payload.
    let mut buf = String::new();
    let mut stream = resp.bytes_stream();
    let mut failed = false;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("reading event stream")?;
        buf.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(pos) = buf.find("\n\n") {
            let frame: String = buf.drain(..pos + 2).collect();
            for line in frame.lines() {
                let Some(payload) = line.strip_prefix("data: ") else { continue };
                match serde_json::from_str::<serde_json::Value>(payload) {
                    Ok(v) => {
                        if v.get("type").and_then(|t| t.as_str()) == Some("error") {
                            failed = true;
                        }
                        print_event(&v);
                    }
                    Err(e) => eprintln!("unreadable frame: {e}"),
                }
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
