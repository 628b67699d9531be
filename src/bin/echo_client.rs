//! WebSocket echo client
//!
//! Connects, sends every stdin line as a text message and prints whatever
//! comes back. Reconnects 5 seconds after losing the connection.
//!
//! Usage: `echo_client [URL] [CA_PEM]` (the CA bundle is needed for `wss://`
//! and requires the `tls` feature). Log level via `RUST_LOG`.

use std::process::ExitCode;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use ws_tether::prelude::*;

const DEFAULT_URL: &str = "ws://127.0.0.1:9001/";

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let url = args.next().unwrap_or_else(|| DEFAULT_URL.to_string());
    let ca_path = args.next();

    println!("WebSocket echo client ({url})");

    let result = match ca_path {
        #[cfg(feature = "tls")]
        Some(path) => match std::fs::read(&path)
            .map_err(Error::from)
            .and_then(|pem| TlsConnector::from_pem(&pem))
        {
            Ok(connector) => run(connector, url),
            Err(e) => Err(e),
        },
        #[cfg(not(feature = "tls"))]
        Some(_) => {
            eprintln!("CA bundle given but built without the `tls` feature");
            return ExitCode::FAILURE;
        }
        None => run(TcpConnector, url),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run<C: Connector>(connector: C, url: String) -> Result<()> {
    dispatch_until(async move {
        let client = WsClient::new(connector, TokioScheduler, Config::default());

        let callbacks = Callbacks::new(
            |opcode, payload| {
                println!(
                    "Received message. opcode={opcode:?}, size={}, content: {}",
                    payload.len(),
                    String::from_utf8_lossy(payload)
                );
            },
            || println!("Websocket disconnected, trying to reconnect in 5 seconds"),
        )
        .on_open(|| println!("Connected to websocket server, type a line to send it"))
        .on_give_up(|attempts| eprintln!("Giving up after {attempts} reconnect attempts"));

        println!("Connecting to websocket server...");
        if let Err(e) = client.connect(&url, callbacks) {
            if !e.is_connection_fatal() {
                return Err(e);
            }
            eprintln!("Failed to connect to websocket server ({e})");
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => match client.send_text(&line) {
                        Ok(()) => println!("Sent {} bytes over websocket", line.len()),
                        Err(e) => eprintln!("Failed to send over websocket ({e})"),
                    },
                    Ok(None) | Err(_) => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        client.disconnect();
        // Give the close frame and its echo a moment
        tokio::time::sleep(Duration::from_millis(250)).await;
        Ok(())
    })?
}
