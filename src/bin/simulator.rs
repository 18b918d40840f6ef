//! Simulator host: runs the pump engine behind a newline-delimited JSON
//! envelope bus over TCP. Every connected client receives every published
//! event; inbound envelopes from any client are routed to the engine.

use std::sync::Arc;

use clap::{App, Arg};
use pumpbus::agent::{AgentConfig, PumpAgent};
use pumpbus::rng::DEFAULT_SEED;
use pumpbus::transport::{self, Envelope};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

const EVENT_BROADCAST_BUFFER_SIZE: usize = 256;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("pumpbus-simulator")
        .version("0.1.0")
        .about("Pump controller simulator - hosts the engine on a TCP envelope bus")
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("Address to listen on")
                .takes_value(true)
                .default_value("127.0.0.1"),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Port to listen on")
                .takes_value(true)
                .default_value("1883"),
        )
        .arg(
            Arg::with_name("error-rate")
                .long("error-rate")
                .value_name("RATE")
                .help("Probability of a simulated dispense failure (0.0-1.0)")
                .takes_value(true)
                .default_value("0.0"),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .value_name("SEED")
                .help("Seed for deterministic simulation randomness")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("firmware-version")
                .long("firmware-version")
                .value_name("LABEL")
                .help("Firmware label reported in heartbeats")
                .takes_value(true)
                .default_value("SIM_v1.0.0"),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap();
    let port = matches.value_of("port").unwrap().parse::<u16>()?;
    let error_rate = matches.value_of("error-rate").unwrap().parse::<f64>()?;
    if !(0.0..=1.0).contains(&error_rate) {
        return Err("error rate must be between 0.0 and 1.0".into());
    }
    let seed = match matches.value_of("seed") {
        Some(raw) => raw.parse::<u64>()?,
        None => DEFAULT_SEED,
    };
    let firmware_version = matches.value_of("firmware-version").unwrap().to_owned();

    println!("Pump Bus Simulator");
    println!("==================");
    println!("Listening on {}:{}", host, port);
    println!("Error rate: {:.1}%", error_rate * 100.0);
    println!();

    let (publisher, mut events) = transport::channel();
    let mut agent = PumpAgent::new(
        AgentConfig {
            error_rate,
            seed,
            firmware_version,
        },
        publisher,
    );

    // Heartbeat runs for the life of the process
    let _telemetry_task = agent.spawn_telemetry();
    let agent = Arc::new(Mutex::new(agent));

    // Fan published envelopes out to every connected client
    let (event_tx, _) = broadcast::channel::<String>(EVENT_BROADCAST_BUFFER_SIZE);
    let fanout_tx = event_tx.clone();
    let _fanout_task = tokio::spawn(async move {
        while let Some(envelope) = events.recv().await {
            match serde_json::to_string(&envelope) {
                Ok(line) => {
                    // Send fails only when no client is connected; events are
                    // best-effort there, like an unsubscribed bus topic
                    let _ = fanout_tx.send(line);
                }
                Err(e) => warn!("failed to encode envelope: {}", e),
            }
        }
    });

    let listener = TcpListener::bind(format!("{}:{}", host, port)).await?;
    info!("bus listening on {}:{}", host, port);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("client connected: {}", addr);
                let client_agent = Arc::clone(&agent);
                let client_events = event_tx.subscribe();

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_agent, client_events).await {
                        warn!("client {} error: {}", addr, e);
                    }
                    info!("client disconnected: {}", addr);
                });
            }
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    agent: Arc<Mutex<PumpAgent>>,
    mut events: broadcast::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    // Stream published events to this client
    let event_writer = Arc::clone(&writer);
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(line) => {
                    let mut writer_guard = event_writer.lock().await;
                    if writer_guard.write_all(line.as_bytes()).await.is_err()
                        || writer_guard.write_all(b"\n").await.is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("client event stream lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Route inbound envelopes from this client
    let mut line = String::new();
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => break, // client disconnected
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                match serde_json::from_str::<Envelope>(trimmed) {
                    Ok(envelope) => {
                        let payload = envelope.payload.to_string();
                        let mut agent_guard = agent.lock().await;
                        agent_guard.handle_message(&envelope.topic, payload.as_bytes());
                    }
                    Err(e) => {
                        // A broken frame never stops the stream
                        warn!("unparseable envelope from client: {}", e);
                    }
                }
            }
            Err(e) => {
                warn!("error reading from client: {}", e);
                break;
            }
        }
    }

    event_task.abort();
    Ok(())
}
