//! # fq CLI
//!
//! Interactive client: reads command lines from stdin, sends them to the
//! server and prints the response with the round-trip time. `quit` or
//! `exit` leaves the session.

use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use fq_core::utils::{parse_duration, parse_size};
use fq_server::client::{parse_response, Response, TcpClient};

#[derive(Parser)]
#[command(name = "fq")]
#[command(about = "Interactive fq client")]
#[command(version)]
struct Cli {
    /// Address of the database
    #[arg(long, default_value = "127.0.0.1:1945")]
    address: String,

    /// Idle timeout for the connection (e.g. 1m)
    #[arg(long, default_value = "1m")]
    idle_timeout: String,

    /// Max message size for the connection (e.g. 4KB)
    #[arg(long, default_value = "4KB")]
    max_message_size: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let idle_timeout: Duration =
        parse_duration(&cli.idle_timeout).context("parse idle timeout")?;
    let max_message_size = parse_size(&cli.max_message_size).context("parse max message size")?;

    let mut client = TcpClient::connect(&cli.address, max_message_size, idle_timeout)
        .await
        .with_context(|| format!("connect to {}", cli.address))?;

    let stdin = std::io::stdin();
    let mut line = String::new();

    loop {
        print!("[fq] > ");
        std::io::stdout().flush()?;

        line.clear();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }

        let request = line.trim();
        if request.is_empty() {
            continue;
        }
        if request.eq_ignore_ascii_case("quit") || request.eq_ignore_ascii_case("exit") {
            break;
        }

        let start = Instant::now();
        let raw = client
            .send(request)
            .await
            .context("send query (connection may be closed)")?;
        let elapsed = start.elapsed();

        match parse_response(&raw) {
            Ok(Response::Ok(payload)) => {
                println!("[fq] > {payload}\t\t\t\tElapsed: {elapsed:?}");
            }
            Ok(Response::Err(message)) => {
                println!("[fq] > error: {message}\t\t\t\tElapsed: {elapsed:?}");
            }
            Err(_) => println!("[fq] > malformed response: {raw}"),
        }
    }

    Ok(())
}
