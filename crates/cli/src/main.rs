use std::io;
use std::process::ExitCode;
use std::thread;

use clap::Parser;
use rtptest::{AnnexBConfig, Looper, Orchestrator, OrchestratorConfig, OrchestratorHandle, Role, UdpEndpoints};

#[derive(Parser)]
#[command(
    name = "rtptest",
    about = "Paced RTP sender/receiver test tool for H.264 streams"
)]
struct Args {
    /// Listen for an incoming RTP stream
    #[arg(long, short)]
    listen: bool,

    /// Stream the media source to host:port (control on port+1)
    #[arg(long, short, value_name = "HOST:PORT", value_parser = parse_endpoint)]
    connect: Option<Endpoint>,

    /// Annex B H.264 file to stream in connect mode
    #[arg(long, default_value = "media/test.h264")]
    source: String,

    /// RTP payload type
    #[arg(long, default_value_t = rtptest::config::DEFAULT_PAYLOAD_TYPE, value_parser = clap::value_parser!(u8).range(0..=127))]
    payload_type: u8,

    /// Capacity of the sample read buffer in bytes
    #[arg(long, default_value_t = rtptest::config::DEFAULT_MAX_SAMPLE_SIZE)]
    max_sample_size: usize,

    /// Frame rate used to timestamp the elementary stream
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u32).range(1..))]
    fps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    host: String,
    port: u16,
}

/// Parse `host:port`, splitting on the last colon. IPv6 hosts may be
/// bracketed (`[::1]:5000`).
fn parse_endpoint(s: &str) -> Result<Endpoint, String> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected host:port, got '{s}'"))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(format!("missing host in '{s}'"));
    }
    let port: u16 = port.parse().map_err(|_| format!("invalid port '{port}'"))?;
    if port == 0 {
        return Err("port must be in 1..=65535".to_string());
    }
    Ok(Endpoint {
        host: host.to_string(),
        port,
    })
}

/// Post a stop when the operator presses Enter. EOF leaves the session
/// running until it ends on its own.
fn stop_on_enter(handle: OrchestratorHandle) {
    let spawned = thread::Builder::new().name("stdin".to_string()).spawn(move || {
        let mut input = String::new();
        match io::stdin().read_line(&mut input) {
            Ok(n) if n > 0 => handle.stop(),
            Ok(_) => tracing::debug!("stdin closed"),
            Err(e) => tracing::warn!(error = %e, "failed to read stdin"),
        }
    });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "failed to spawn stdin watcher");
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    if !args.listen && args.connect.is_none() {
        eprintln!("Nothing to do: pass --listen and/or --connect HOST:PORT");
        return ExitCode::FAILURE;
    }

    let config = OrchestratorConfig {
        media_source: args.source,
        payload_type: args.payload_type,
        max_sample_size: args.max_sample_size,
        ..OrchestratorConfig::default()
    };
    let endpoints = UdpEndpoints::new(AnnexBConfig { frame_rate: args.fps });

    let mut looper = Looper::new("rtptest");
    let handle = Orchestrator::new(config, Box::new(endpoints))
        .with_port_reporter(|role, port| match role {
            Role::Receiver => println!("picked receiver RTP port {port}"),
            Role::Sender => println!("picked sender RTP port {port}"),
        })
        .attach(&mut looper);

    if args.listen {
        handle.listen();
    }
    if let Some(endpoint) = &args.connect {
        handle.connect(&endpoint.host, endpoint.port);
    }

    println!("Running, press Enter to stop");
    stop_on_enter(handle.clone());
    let delivered = looper.run();

    let status = handle.status();
    tracing::info!(delivered, samples_sent = status.samples_sent, "done");
    match status.last_error {
        Some(e) => {
            eprintln!("Failed: {e}");
            ExitCode::FAILURE
        }
        None => ExitCode::SUCCESS,
    }
}
