//! kite-say: send text to a running kite's speech API.
//!
//! Reads the text from arguments, or from stdin when none are given.

use std::io::Read;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(name = "kite-say", about = "Speak text through a running kite")]
struct Args {
    /// Stop current speech and say this next
    #[arg(long)]
    interrupt: bool,

    /// Wait until the text has been spoken
    #[arg(long)]
    wait: bool,

    /// Cancel all queued and current speech instead of speaking
    #[arg(long)]
    cancel: bool,

    /// Speech API port
    #[arg(long, default_value_t = 8767)]
    port: u16,

    text: Vec<String>,
}

#[derive(Serialize)]
struct SpeakRequest {
    text: String,
    interrupt: bool,
    wait: bool,
}

#[derive(Deserialize, Debug)]
struct ApiResponse {
    status: String,
    id: Option<u64>,
    state: Option<String>,
    detail: Option<String>,
    cancelled: Option<usize>,
    error: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let api = format!("http://127.0.0.1:{}", args.port);

    // Spoken-to-completion requests can take a while.
    let timeout = if args.wait { Duration::from_secs(600) } else { Duration::from_secs(5) };
    let client = Client::builder()
        .connect_timeout(Duration::from_millis(300))
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new());

    let request = if args.cancel {
        client.post(format!("{api}/cancel")).json(&serde_json::json!({}))
    } else {
        let text = match read_text(&args.text) {
            Some(t) => t,
            None => {
                eprintln!("kite-say: nothing to say");
                return ExitCode::FAILURE;
            }
        };
        client.post(format!("{api}/speak")).json(&SpeakRequest {
            text,
            interrupt: args.interrupt,
            wait: args.wait,
        })
    };

    let resp = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("kite-say: speech API unreachable at {api}: {e}");
            return ExitCode::FAILURE;
        }
    };
    let body: ApiResponse = match resp.json().await {
        Ok(b) => b,
        Err(e) => {
            eprintln!("kite-say: bad response: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(error) = body.error {
        eprintln!("kite-say: {error}");
        return ExitCode::FAILURE;
    }
    match (body.cancelled, body.id, body.state) {
        (Some(n), _, _) => println!("cancelled {n}"),
        (_, Some(id), Some(state)) => match body.detail {
            Some(detail) => println!("u{id} {state} ({detail})"),
            None => println!("u{id} {state}"),
        },
        _ => println!("{}", body.status),
    }
    ExitCode::SUCCESS
}

fn read_text(words: &[String]) -> Option<String> {
    let text = if words.is_empty() {
        let mut input = String::new();
        std::io::stdin().read_to_string(&mut input).ok()?;
        input
    } else {
        words.join(" ")
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
