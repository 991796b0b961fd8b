use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use bench_supply::{Bench, BenchConfig, ChannelDescriptor, PowerStatus, ResourceAddress, Vxi11Transport};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "bench-supply", about = "Discover and drive SCPI bench power supplies")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, default_value = "bench.toml")]
    config: PathBuf,

    /// Extra resource to probe, e.g. TCPIP0::192.168.0.232::inst0::INSTR.
    #[arg(long = "resource", value_name = "ADDR")]
    resources: Vec<String>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List identified channels.
    Scan,
    /// Connect, arm both protection limits, then program the voltage.
    Apply {
        /// 1-based position in the scan listing.
        index: usize,
        #[arg(long, value_name = "VOLTS")]
        ovp: String,
        #[arg(long, value_name = "AMPS")]
        ocp: String,
        #[arg(long, value_name = "VOLTS")]
        volts: String,
        #[arg(long, value_enum)]
        output: Option<OutputState>,
        #[arg(long)]
        measure: bool,
        /// Unlock every instrument before exiting.
        #[arg(long)]
        release: bool,
    },
    /// Read voltage, current and power.
    Measure { index: usize },
    /// Switch the output on or off.
    Output {
        index: usize,
        #[arg(value_enum)]
        state: OutputState,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputState {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = BenchConfig::load(&cli.config)?;
    config.resources.extend(cli.resources.iter().cloned());
    if config.resources.is_empty() {
        return Err(anyhow!(
            "no resources configured; pass --resource or list them in {}",
            cli.config.display()
        ));
    }

    let resources = config.resources.iter().map(|r| ResourceAddress::new(r.as_str())).collect();
    let bench = Bench::new(Arc::new(Vxi11Transport::new(resources)), &config);
    let channels = bench.discover().await.context("discovery failed")?;

    match cli.command {
        Command::Scan => {
            if channels.is_empty() {
                println!("No identifiable devices found.");
            }
            for (i, descriptor) in channels.iter().enumerate() {
                let power = match bench.state(descriptor).map(|s| s.power) {
                    Some(PowerStatus::On) => "ON",
                    _ => "OFF",
                };
                println!(
                    "{:>2}. #{} {:<32} {}  power {}",
                    i + 1,
                    descriptor.ordinal,
                    bench.label(descriptor),
                    descriptor.address,
                    power
                );
            }
        }
        Command::Apply {
            index,
            ovp,
            ocp,
            volts,
            output,
            measure,
            release,
        } => {
            let descriptor = pick(&channels, index)?;
            let outcome = apply(&bench, descriptor, &ovp, &ocp, &volts, output, measure).await;
            if release {
                bench.clear_all().await;
            }
            outcome?;
        }
        Command::Measure { index } => {
            let descriptor = pick(&channels, index)?;
            let m = bench.measure_once(descriptor).await?;
            print_measurement(&bench, descriptor, &m);
        }
        Command::Output { index, state } => {
            let descriptor = pick(&channels, index)?;
            bench.connect(descriptor).await?;
            let outcome = match state {
                OutputState::On => bench.power_on(descriptor).await,
                OutputState::Off => bench.power_off(descriptor).await,
            };
            let released = bench.disconnect(descriptor).await;
            outcome?;
            released?;
        }
    }
    Ok(())
}

async fn apply(
    bench: &Bench,
    descriptor: &ChannelDescriptor,
    ovp: &str,
    ocp: &str,
    volts: &str,
    output: Option<OutputState>,
    measure: bool,
) -> Result<()> {
    bench.connect(descriptor).await?;
    bench.arm_over_voltage(descriptor, ovp).await?;
    bench.arm_over_current(descriptor, ocp).await?;
    bench.set_voltage(descriptor, volts).await?;
    match output {
        Some(OutputState::On) => bench.power_on(descriptor).await?,
        Some(OutputState::Off) => bench.power_off(descriptor).await?,
        None => {}
    }
    if measure {
        let m = bench.measure(descriptor).await?;
        print_measurement(bench, descriptor, &m);
    }
    Ok(())
}

fn pick(channels: &[ChannelDescriptor], index: usize) -> Result<&ChannelDescriptor> {
    index
        .checked_sub(1)
        .and_then(|i| channels.get(i))
        .ok_or_else(|| anyhow!("no channel {index}; run `scan` to list {} channel(s)", channels.len()))
}

fn print_measurement(bench: &Bench, descriptor: &ChannelDescriptor, m: &bench_supply::Measurement) {
    println!("{}:", bench.label(descriptor));
    println!("  Voltage : {}", m.voltage);
    println!("  Current : {}", m.current);
    println!("  Power   : {}", m.power);
}
