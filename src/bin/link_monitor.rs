//! Bench tool: listens on a serial port wired to the controller's output and
//! prints every decoded lifecycle command and angle frame.

use clap::Parser;
use log::warn;
use std::io::{ErrorKind, Read};
use std::time::Duration;

use mocap_hover::protocol::{LinkDecoder, LinkMessage};
use mocap_hover::transport::open_port;

#[derive(Parser, Debug)]
#[command(name = "link_monitor", about = "Decode the hover command stream", long_about = None)]
struct Args {
    /// Serial device to listen on
    port: String,

    #[arg(short, long, default_value_t = 115200)]
    baud: u32,

    /// Only print every n-th angle frame
    #[arg(long, default_value_t = 1)]
    every: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut port = open_port(&args.port, args.baud)?;
    port.set_read_timeout(Duration::from_millis(1000))?;
    println!("listening on {} at {} baud", args.port, args.baud);

    let mut decoder = LinkDecoder::new();
    let mut buffer = [0u8; 256];
    let mut frames: u64 = 0;
    loop {
        let n = match port.read(&mut buffer) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::TimedOut => continue,
            Err(e) => return Err(e.into()),
        };
        for message in decoder.push(&buffer[..n]) {
            match message {
                Ok(LinkMessage::Lifecycle(command)) => println!("command: {command}"),
                Ok(LinkMessage::Angles(command)) => {
                    frames += 1;
                    if frames % args.every.max(1) == 0 {
                        println!(
                            "#{frames} roll={:+.3} deg pitch={:+.3} deg",
                            command.roll_deg(),
                            command.pitch_deg()
                        );
                    }
                }
                Ok(LinkMessage::Text(text)) => println!("text: {text:?}"),
                Err(e) => warn!("{e}"),
            }
        }
    }
}
