use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::info;

use wolctl::config::Config;
use wolctl::ping::IcmpProber;
use wolctl::server;
use wolctl::status::{poll_all, PROBE_TIMEOUT};
use wolctl::wol::{HardwareAddr, MagicPacket, WOL_PORT};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "wolctl.toml", env = "WOLCTL_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a magic packet to wake a machine.
    Send {
        /// MAC address of the machine to wake.
        #[arg(short, long, conflicts_with = "name", required_unless_present = "name")]
        mac: Option<String>,

        /// Name of a configured machine to wake.
        #[arg(short, long)]
        name: Option<String>,

        /// Send unicast to this address instead of broadcasting (wake over WAN).
        #[arg(long)]
        ip: Option<String>,

        /// UDP port for unicast delivery.
        #[arg(long, default_value_t = WOL_PORT)]
        port: u16,
    },
    /// Serve the web interface.
    Serve {
        /// Address to listen on, overriding the config file.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Print the reachability of every configured machine.
    Status,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("INFO"))
        .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Millis))
        .init();

    let config = Config::load(&args.config)?;

    match args.command {
        Command::Send {
            mac,
            name,
            ip,
            port,
        } => {
            let mac: HardwareAddr = match (mac, name) {
                (Some(mac), None) => mac.parse()?,
                (None, Some(name)) => {
                    let machine = config
                        .machine(&name)
                        .ok_or_else(|| format!("no machine named {:?} in config", name))?;
                    machine.mac.parse()?
                }
                // clap enforces exactly one of --mac/--name
                _ => unreachable!(),
            };
            let packet = MagicPacket::new(mac);
            match ip {
                Some(ip) => {
                    let target = format!("{}:{}", ip, port);
                    info!("sending magic packet for {} to {}", mac, target);
                    packet.send(&target)?;
                }
                None => {
                    info!("broadcasting magic packet for {}", mac);
                    packet.broadcast()?;
                }
            }
            info!("magic packet sent");
        }
        Command::Serve { listen } => {
            let mut config = config;
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            server::run(config);
        }
        Command::Status => {
            let prober = IcmpProber::new(PROBE_TIMEOUT, config.ping.privileged);
            let statuses = poll_all(&config.machines, &prober);
            let mut names: Vec<&String> = statuses.keys().collect();
            names.sort();
            for name in names {
                println!("{}\t{}", name, statuses[name].as_str());
            }
        }
    }
    Ok(())
}
