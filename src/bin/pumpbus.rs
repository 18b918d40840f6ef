//! Operator CLI for the pump bus simulator: publishes command envelopes over
//! the TCP bus and tails the event stream.

use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use pumpbus::protocol::{topics, IngredientStep, Qos};
use pumpbus::transport::Envelope;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration, Instant};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "1883";
const DEFAULT_WAIT_SECS: u64 = 120;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("pumpbus")
        .version("0.1.0")
        .about("Pump Bus Simulator CLI - drive the simulated dispensing controller")
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Simulator host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Simulator port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("json")
                .long("json")
                .help("Print raw event envelopes instead of formatted output")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("dispense")
                .about("Dispense a volume from one pump")
                .arg(
                    Arg::with_name("pump")
                        .help("Pump id")
                        .required(true)
                        .validator(validate_i32),
                )
                .arg(
                    Arg::with_name("amount")
                        .help("Volume in ml")
                        .required(true)
                        .validator(validate_f64),
                )
                .arg(
                    Arg::with_name("duration")
                        .long("duration")
                        .value_name("MS")
                        .help("Dispense duration in ms (derived from volume when omitted)")
                        .takes_value(true)
                        .validator(validate_u64),
                )
                .arg(
                    Arg::with_name("recipe-name")
                        .long("recipe-name")
                        .value_name("NAME")
                        .help("Label echoed in the completion event")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("recipe")
                .about("Dispense a multi-pump recipe")
                .arg(
                    Arg::with_name("name")
                        .long("name")
                        .value_name("NAME")
                        .help("Recipe name")
                        .takes_value(true)
                        .default_value("Unknown"),
                )
                .arg(
                    Arg::with_name("step")
                        .long("step")
                        .short("s")
                        .value_name("PUMP:ML[:INGREDIENT]")
                        .help("Ingredient step, repeatable, runs in the order given")
                        .takes_value(true)
                        .multiple(true)
                        .required(true)
                        .validator(validate_step),
                ),
        )
        .subcommand(
            SubCommand::with_name("flush")
                .about("Rinse one pump, or all pumps with id -1")
                .arg(
                    Arg::with_name("pump")
                        .help("Pump id (-1 = all pumps)")
                        .required(true)
                        .allow_hyphen_values(true)
                        .validator(validate_i32),
                )
                .arg(
                    Arg::with_name("duration")
                        .help("Flush duration in ms")
                        .required(true)
                        .validator(validate_u64),
                ),
        )
        .subcommand(
            SubCommand::with_name("calibrate")
                .about("Run a timed test dispense and derive the pump's flow rate")
                .arg(
                    Arg::with_name("pump")
                        .help("Pump id")
                        .required(true)
                        .validator(validate_i32),
                )
                .arg(
                    Arg::with_name("amount")
                        .long("amount")
                        .value_name("ML")
                        .help("Test volume in ml")
                        .takes_value(true)
                        .default_value("50.0")
                        .validator(validate_f64),
                ),
        )
        .subcommand(
            SubCommand::with_name("stop")
                .about("Trigger the emergency stop (auto-releases after 2 seconds)")
                .arg(
                    Arg::with_name("reason")
                        .help("Reason recorded in the error event")
                        .default_value("Operator stop"),
                ),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("Tail every event the simulator publishes")
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("SECONDS")
                        .help("Stop after this many seconds (default: run forever)")
                        .takes_value(true)
                        .validator(validate_u64),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap().to_owned();
    let port = matches.value_of("port").unwrap().parse::<u16>()?;
    let raw_json = matches.is_present("json");

    match matches.subcommand() {
        ("dispense", Some(sub)) => handle_dispense(sub, &host, port, raw_json).await?,
        ("recipe", Some(sub)) => handle_recipe(sub, &host, port, raw_json).await?,
        ("flush", Some(sub)) => handle_flush(sub, &host, port, raw_json).await?,
        ("calibrate", Some(sub)) => handle_calibrate(sub, &host, port, raw_json).await?,
        ("stop", Some(sub)) => handle_stop(sub, &host, port, raw_json).await?,
        ("monitor", Some(sub)) => handle_monitor(sub, &host, port, raw_json).await?,
        _ => {
            println!(
                "{}",
                "No command specified. Use --help for usage information.".yellow()
            );
            println!("{}", "Quick start:".bright_green());
            println!(
                "  {} Dispense 100ml from pump 1",
                "pumpbus dispense 1 100".bright_cyan()
            );
            println!(
                "  {} Flush every pump for a second",
                "pumpbus flush -- -1 1000".bright_cyan()
            );
            println!("  {} Watch the event stream", "pumpbus monitor".bright_cyan());
        }
    }

    Ok(())
}

async fn handle_dispense(
    matches: &ArgMatches<'_>,
    host: &str,
    port: u16,
    raw_json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let pump_id: i32 = matches.value_of("pump").unwrap().parse()?;
    let amount_ml: f64 = matches.value_of("amount").unwrap().parse()?;

    let mut payload = serde_json::json!({
        "pump_id": pump_id,
        "amount_ml": amount_ml,
    });
    if let Some(duration) = matches.value_of("duration") {
        payload["duration_ms"] = duration.parse::<u64>()?.into();
    }
    if let Some(name) = matches.value_of("recipe-name") {
        payload["recipe_name"] = name.into();
    }

    let mut bus = Bus::connect(host, port).await?;
    bus.send(topics::DISPENSE_COMMAND, payload, Qos::AtLeastOnce)
        .await?;
    println!(
        "{} Dispensing {}ml from pump {}...",
        "▶".bright_blue(),
        amount_ml,
        pump_id
    );
    bus.await_terminal_event(raw_json).await
}

async fn handle_recipe(
    matches: &ArgMatches<'_>,
    host: &str,
    port: u16,
    raw_json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let name = matches.value_of("name").unwrap();
    let steps: Vec<IngredientStep> = matches
        .values_of("step")
        .unwrap()
        .enumerate()
        .map(|(idx, raw)| {
            let mut step = parse_step(raw).expect("validated by clap");
            step.order = Some(idx as u32 + 1);
            step
        })
        .collect();
    let total_ml: f64 = steps.iter().map(|s| s.quantity_ml).sum();
    let step_count = steps.len();

    // The engine keys multi-pump dispatch off the amount_ml shape; pump_id
    // still has to be present, the first step's pump is conventional.
    let payload = serde_json::json!({
        "pump_id": steps[0].pump_number,
        "amount_ml": steps,
        "recipe_name": name,
    });

    let mut bus = Bus::connect(host, port).await?;
    bus.send(topics::DISPENSE_COMMAND, payload, Qos::AtLeastOnce)
        .await?;
    println!(
        "{} Recipe '{}': {} steps, {:.1}ml total...",
        "▶".bright_blue(),
        name,
        step_count,
        total_ml
    );
    bus.await_terminal_event(raw_json).await
}

async fn handle_flush(
    matches: &ArgMatches<'_>,
    host: &str,
    port: u16,
    raw_json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let pump_id: i32 = matches.value_of("pump").unwrap().parse()?;
    let duration_ms: u64 = matches.value_of("duration").unwrap().parse()?;

    let payload = serde_json::json!({
        "pump_id": pump_id,
        "duration_ms": duration_ms,
    });

    let mut bus = Bus::connect(host, port).await?;
    bus.send(topics::MAINTENANCE_FLUSH, payload, Qos::AtLeastOnce)
        .await?;
    if pump_id == -1 {
        println!(
            "{} Flushing all pumps for {}ms...",
            "▶".bright_blue(),
            duration_ms
        );
    } else {
        println!(
            "{} Flushing pump {} for {}ms...",
            "▶".bright_blue(),
            pump_id,
            duration_ms
        );
    }
    bus.await_terminal_event(raw_json).await
}

async fn handle_calibrate(
    matches: &ArgMatches<'_>,
    host: &str,
    port: u16,
    raw_json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let pump_id: i32 = matches.value_of("pump").unwrap().parse()?;
    let test_amount_ml: f64 = matches.value_of("amount").unwrap().parse()?;

    let payload = serde_json::json!({
        "pump_id": pump_id,
        "test_amount_ml": test_amount_ml,
    });

    let mut bus = Bus::connect(host, port).await?;
    bus.send(topics::CALIBRATION_START, payload, Qos::AtLeastOnce)
        .await?;
    println!(
        "{} Calibrating pump {} with {}ml...",
        "▶".bright_blue(),
        pump_id,
        test_amount_ml
    );
    bus.await_terminal_event(raw_json).await
}

async fn handle_stop(
    matches: &ArgMatches<'_>,
    host: &str,
    port: u16,
    raw_json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let reason = matches.value_of("reason").unwrap();

    let mut bus = Bus::connect(host, port).await?;
    bus.send(
        topics::EMERGENCY_STOP,
        serde_json::json!({ "reason": reason }),
        Qos::ExactlyOnce,
    )
    .await?;
    println!("{} EMERGENCY STOP: {}", "■".bright_red().bold(), reason);
    bus.await_terminal_event(raw_json).await
}

async fn handle_monitor(
    matches: &ArgMatches<'_>,
    host: &str,
    port: u16,
    raw_json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let deadline = matches
        .value_of("duration")
        .map(|d| Instant::now() + Duration::from_secs(d.parse::<u64>().unwrap()));

    println!(
        "{}",
        "Monitoring pump bus events (Ctrl+C to stop)...".bright_blue().bold()
    );

    let mut bus = Bus::connect(host, port).await?;
    loop {
        let read = async { bus.next_event().await };
        let envelope = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match timeout(remaining, read).await {
                    Ok(result) => result?,
                    Err(_) => break,
                }
            }
            None => read.await?,
        };
        let Some(envelope) = envelope else { break };
        print_event(&envelope, raw_json);
    }

    Ok(())
}

/// Line-delimited envelope connection to the simulator.
struct Bus {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    line: String,
}

impl Bus {
    async fn connect(host: &str, port: u16) -> Result<Self, Box<dyn std::error::Error>> {
        let stream = TcpStream::connect((host, port)).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            line: String::new(),
        })
    }

    async fn send(
        &mut self,
        topic: &str,
        payload: serde_json::Value,
        qos: Qos,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let envelope = Envelope {
            topic: topic.to_owned(),
            qos,
            retain: false,
            payload,
        };
        let line = serde_json::to_string(&envelope)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<Envelope>, Box<dyn std::error::Error>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line).await? == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Envelope>(trimmed) {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(_) => continue,
            }
        }
    }

    /// Print events until the command's terminal event (completion or error)
    /// arrives, or the wait budget runs out.
    async fn await_terminal_event(
        &mut self,
        raw_json: bool,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let deadline = Instant::now() + Duration::from_secs(DEFAULT_WAIT_SECS);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                println!("{}", "Timed out waiting for a terminal event".yellow());
                return Ok(());
            }
            let envelope = match timeout(remaining, self.next_event()).await {
                Ok(result) => result?,
                Err(_) => {
                    println!("{}", "Timed out waiting for a terminal event".yellow());
                    return Ok(());
                }
            };
            let Some(envelope) = envelope else {
                println!("{}", "Connection closed by simulator".yellow());
                return Ok(());
            };

            // Heartbeats are noise while waiting on a command
            if envelope.topic == topics::HEARTBEAT {
                continue;
            }
            print_event(&envelope, raw_json);

            match envelope.topic.as_str() {
                topics::DISPENSE_COMPLETE | topics::MAINTENANCE_COMPLETE | topics::ERROR => {
                    return Ok(());
                }
                _ => {}
            }
        }
    }
}

fn print_event(envelope: &Envelope, raw_json: bool) {
    if raw_json {
        match serde_json::to_string(envelope) {
            Ok(line) => println!("{}", line),
            Err(_) => {}
        }
        return;
    }

    let payload = &envelope.payload;
    match envelope.topic.as_str() {
        topics::STATUS => {
            let progress = payload["progress_ml"].as_f64().unwrap_or(0.0);
            let target = payload["target_ml"].as_f64().unwrap_or(0.0);
            let flow = payload["flow_rate_ml_s"].as_f64().unwrap_or(0.0);
            let pump = payload["pump_id"].as_i64().unwrap_or(0);
            let percent = if target > 0.0 { progress / target * 100.0 } else { 0.0 };
            println!(
                "  pump {} {:>6.1}/{:.1}ml ({:>3.0}%) {:.1} ml/s",
                pump,
                progress,
                target,
                percent,
                flow
            );
        }
        topics::DISPENSE_COMPLETE => {
            println!(
                "{} Dispense complete: {}ml of {}ml in {}ms",
                "✓".bright_green(),
                payload["actual_ml"],
                payload["requested_ml"],
                payload["duration_ms"]
            );
        }
        topics::MAINTENANCE_COMPLETE => {
            if payload["action_type"] == "calibration" {
                println!(
                    "{} Calibration complete: pump {}, {} ml/s",
                    "✓".bright_green(),
                    payload["pump_id"],
                    payload["ml_per_second"]
                );
            } else {
                println!(
                    "{} Flush complete: pump {}",
                    "✓".bright_green(),
                    payload["pump_id"]
                );
            }
        }
        topics::ERROR => {
            println!(
                "{} {} (pump {}, {}): {}",
                "✗".bright_red(),
                payload["error_code"].as_str().unwrap_or("ERROR").bright_red(),
                payload["pump_id"],
                payload["severity"].as_str().unwrap_or("unknown"),
                payload["message"].as_str().unwrap_or("")
            );
        }
        topics::HEARTBEAT => {
            println!(
                "{} heartbeat: uptime {}s, rssi {}dBm, {} pumps active",
                "♥".bright_black(),
                payload["uptime_ms"].as_u64().unwrap_or(0) / 1000,
                payload["wifi_rssi"],
                payload["pumps_active"]
            );
        }
        other => {
            println!("{} {}", other.bright_black(), payload);
        }
    }
}

fn parse_step(raw: &str) -> Result<IngredientStep, String> {
    let mut parts = raw.splitn(3, ':');
    let pump = parts
        .next()
        .ok_or("missing pump id")?
        .parse::<i32>()
        .map_err(|_| format!("invalid pump id in step '{}'", raw))?;
    let quantity = parts
        .next()
        .ok_or_else(|| format!("missing quantity in step '{}'", raw))?
        .parse::<f64>()
        .map_err(|_| format!("invalid quantity in step '{}'", raw))?;
    let ingredient = parts.next().unwrap_or("Unknown").to_owned();

    Ok(IngredientStep {
        pump_number: pump,
        quantity_ml: quantity,
        ingredient,
        order: None,
    })
}

fn validate_i32(v: String) -> Result<(), String> {
    v.parse::<i32>()
        .map(|_| ())
        .map_err(|_| format!("'{}' is not a valid integer", v))
}

fn validate_u64(v: String) -> Result<(), String> {
    v.parse::<u64>()
        .map(|_| ())
        .map_err(|_| format!("'{}' is not a valid non-negative integer", v))
}

fn validate_f64(v: String) -> Result<(), String> {
    v.parse::<f64>()
        .map(|_| ())
        .map_err(|_| format!("'{}' is not a valid number", v))
}

fn validate_step(v: String) -> Result<(), String> {
    parse_step(&v).map(|_| ())
}
