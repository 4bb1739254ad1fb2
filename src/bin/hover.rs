//! Interactive hover session.
//!
//! Listens for mocap frames on UDP, talks to the flight controller over serial
//! and reads `start` / `stop` / `status` / `exit` from stdin.

use clap::Parser;
use log::info;
use std::io::BufRead;
use std::net::SocketAddr;
use std::path::PathBuf;

use mocap_hover::telemetry::{HttpSink, NullSink, TELEMETRY_SERVER_ADDR};
use mocap_hover::transport::{MemoryTransport, SerialTransport};
use mocap_hover::{HoverConfig, HoverController, TelemetrySink, Transport, UdpMocapClient};

#[derive(Parser, Debug)]
#[command(name = "hover", about = "Hold a quadrotor over the mocap origin", long_about = None)]
struct Args {
    /// JSON configuration; missing fields keep their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial device, overriding the config and the platform default
    #[arg(short, long)]
    port: Option<String>,

    /// Address the mocap bridge sends JSON frames to
    #[arg(long, default_value = "0.0.0.0:1511")]
    mocap: SocketAddr,

    /// Post per-tick telemetry to the telemetry server
    #[arg(long)]
    publish: bool,

    /// Telemetry endpoint used with --publish
    #[arg(long, default_value = TELEMETRY_SERVER_ADDR)]
    telemetry_url: String,

    /// Run without a serial port; commands are discarded
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => HoverConfig::from_json_file(path)?,
        None => HoverConfig::default(),
    };
    if let Some(port) = args.port {
        config.serial.port = Some(port);
    }

    let transport: Box<dyn Transport> = if args.dry_run {
        info!("dry run, nothing will be sent to the flight controller");
        Box::new(MemoryTransport::new())
    } else {
        Box::new(SerialTransport::open(&config.serial)?)
    };
    let telemetry: Box<dyn TelemetrySink> = if args.publish {
        Box::new(HttpSink::spawn(&tokio::runtime::Handle::current(), args.telemetry_url))
    } else {
        Box::new(NullSink)
    };
    let mocap = Box::new(UdpMocapClient::new(args.mocap));

    let mut controller = HoverController::new(config, mocap, transport, telemetry)?;

    // the controller blocks while arming and landing, so keep it off the runtime
    tokio::task::spawn_blocking(move || command_loop(&mut controller)).await??;
    Ok(())
}

fn command_loop(controller: &mut HoverController) -> std::io::Result<()> {
    println!("commands: start, stop, status, exit");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line?.trim() {
            "start" => match controller.start() {
                Ok(()) => println!("hovering"),
                Err(e) => println!("start failed: {e}"),
            },
            "stop" => match controller.stop() {
                Ok(()) => println!("landed"),
                Err(e) => println!("stop failed: {e}"),
            },
            "status" => {
                let snapshot = controller.snapshot();
                println!("state: {:?}", controller.state());
                match snapshot.result {
                    Some(result) => {
                        let p = result.filtered_position;
                        println!(
                            "frame {} via {}: ({:.3}, {:.3}, {:.3}) conf={:.2}{}",
                            snapshot.frame_number,
                            snapshot.source,
                            p.x,
                            p.y,
                            p.z,
                            result.confidence,
                            if snapshot.no_data { " [no data]" } else { "" }
                        );
                    }
                    None => println!("no position yet"),
                }
                println!(
                    "frames={} empty={} outliers={} predictions={}",
                    snapshot.stats.total_frames,
                    snapshot.stats.frames_without_data,
                    snapshot.stats.outliers_detected,
                    snapshot.stats.predictions_used
                );
                let filter = controller.filter_statistics();
                println!(
                    "filter: samples={} outlier_rate={:.1}% threshold={:.3} m velocity=({:.3}, {:.3}, {:.3}) m/s",
                    filter.total_samples,
                    filter.outlier_rate * 100.0,
                    filter.current_threshold,
                    filter.estimated_velocity.x,
                    filter.estimated_velocity.y,
                    filter.estimated_velocity.z
                );
            }
            "exit" | "quit" => break,
            "" => {}
            other => println!("unknown command `{other}`"),
        }
    }
    if controller.stop().is_ok() {
        println!("landed");
    }
    Ok(())
}
