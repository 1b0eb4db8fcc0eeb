//! sezatsc: probe Sezmi dual-tuner appliances and print the ATSC channel
//! directory of every broadcast they can receive.

use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, warn};

use sezatsc::tuner::{DEFAULT_CR_MS, NUM_CHANNELS};
use sezatsc::{discover, term, Antenna, DiscoveredDevice, Endpoint, Error, Result};

/// Carrier dwell for the sensitive informational sweep; longer dwell picks
/// up carriers too weak to ever lock.
const SENSITIVE_CR_MS: u64 = 80;

/// Per-carrier deadline for the strength filter.
const STRONG_DEADLINE: Duration = Duration::from_millis(1000);

/// Sleep between demodulator polls.
const POLL_SLEEP: Duration = Duration::from_millis(100);

/// Pause between lock polls while waiting on a channel directory.
const LOCK_POLL: Duration = Duration::from_millis(160);

#[derive(Parser, Debug)]
#[command(name = "sezatsc", version, about = "Scan Sezmi network tuner appliances for ATSC channels", long_about = None)]
struct Args {
    /// RF input: 1 and 2 are the appliance antenna connectors, 3 is the
    /// external coax. Auto-detected when omitted.
    #[arg(short = 'a', value_name = "INPUT", value_parser = clap::value_parser!(u8).range(1..=3))]
    antenna: Option<u8>,

    /// Capture each probed channel's raw TS to <PREFIX><tvch>.ts
    #[arg(long, value_name = "PREFIX")]
    dump: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let antenna = match args.antenna {
        Some(1) => Antenna::Ant1,
        Some(2) => Antenna::Ant2,
        Some(3) => Antenna::Coax,
        _ => Antenna::Nc,
    };

    let devices = discover()?;
    if devices.is_empty() {
        return Err(Error::InvalidArgument(
            "no appliances answered the discovery broadcast".into(),
        ));
    }
    println!(
        "found {} appliance{}, probing in order:",
        devices.len(),
        if devices.len() == 1 { "" } else { "s" }
    );
    for device in &devices {
        println!("  {} ({})", device.addr, device.mac_string());
    }

    for device in devices {
        probe_device(device, antenna, args.dump.as_deref())?;
    }
    Ok(())
}

fn probe_device(device: DiscoveredDevice, antenna: Antenna, dump: Option<&str>) -> Result<()> {
    let mut endpoint = Endpoint::open(device)?;
    let outcome = probe(&mut endpoint, antenna, dump);
    endpoint.close();
    outcome
}

fn probe(endpoint: &mut Endpoint, antenna: Antenna, dump: Option<&str>) -> Result<()> {
    let addr = endpoint.device().addr;
    if antenna != Antenna::Nc {
        endpoint.set_antenna(antenna)?;
    }

    // the default dwell only reports carriers strong enough to be worth
    // tuning; it also settles the antenna choice
    let candidates = endpoint.scan(None, DEFAULT_CR_MS)?;
    if antenna == Antenna::Nc {
        println!("{addr} auto-detected -a{}", endpoint.antenna().cli_index());
    }

    // informational sweep at a long dwell, with a status line
    let bar = ProgressBar::new(1);
    bar.set_style(
        ProgressStyle::with_template("{msg} scan... {pos}/{len}")
            .expect("progress template is valid"),
    );
    bar.set_message(addr.to_string());
    let mut on_progress = |idx: u32, max: u32| {
        bar.set_length(u64::from(max));
        bar.set_position(u64::from(idx));
    };
    let all_carriers = endpoint.scan(Some(&mut on_progress), SENSITIVE_CR_MS)?;
    bar.finish_and_clear();

    let label = short_ip(addr);
    print!("{label} all carrier freqs:");
    for tvch in &all_carriers {
        print!(" {tvch}");
    }
    println!();

    let strong = strong_pass(endpoint, &label, &candidates)?;
    let directory = channel_directory(endpoint, &strong, dump)?;
    if !directory.is_empty() {
        println!("\nfreq  digital channel directory:\n{directory}");
    }
    Ok(())
}

/// Sample the full demodulator on every candidate carrier, both channels in
/// parallel, keeping the ones that reach signal strength within a second.
fn strong_pass(endpoint: &mut Endpoint, label: &str, candidates: &[u32]) -> Result<Vec<u32>> {
    print!("{label} strong freqs:");
    io::stdout().flush()?;

    let mut deadline: [Option<Instant>; NUM_CHANNELS] = [None; NUM_CHANNELS];
    let mut tuned = [0u32; NUM_CHANNELS];
    let mut strong = Vec::new();

    for &tvch in candidates {
        // find a free demodulator, finishing whatever is running on it
        let mut ch = 0usize;
        loop {
            match deadline[ch] {
                None => break,
                Some(d) if Instant::now() > d => {
                    // never got strong: weak carrier
                    deadline[ch] = None;
                    break;
                }
                Some(_) => {
                    if endpoint.get_mse(ch as u8)?.is_strong() {
                        print!(" {}", tuned[ch]);
                        io::stdout().flush()?;
                        strong.push(tuned[ch]);
                        deadline[ch] = None;
                        break;
                    }
                }
            }
            ch += 1;
            if ch >= NUM_CHANNELS {
                thread::sleep(POLL_SLEEP);
                ch = 0;
            }
        }

        deadline[ch] = Some(Instant::now() + STRONG_DEADLINE);
        tuned[ch] = tvch;
        endpoint.set_freq(ch as u8, tvch)?;
        thread::sleep(POLL_SLEEP);
    }

    // drain the in-flight measurements
    loop {
        let mut pending = 0;
        for ch in 0..NUM_CHANNELS {
            let Some(d) = deadline[ch] else { continue };
            if Instant::now() > d {
                deadline[ch] = None;
                continue;
            }
            if endpoint.get_mse(ch as u8)?.is_strong() {
                print!(" {}", tuned[ch]);
                io::stdout().flush()?;
                strong.push(tuned[ch]);
                deadline[ch] = None;
            } else {
                pending += 1;
            }
        }
        if pending == 0 {
            break;
        }
        thread::sleep(POLL_SLEEP);
    }
    println!();
    Ok(strong)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Locking,
    Streaming,
    Done,
}

/// Tune the strong carriers two at a time, wait for full lock, stream until
/// a virtual channel table arrives, and gather the directory text.
fn channel_directory(
    endpoint: &mut Endpoint,
    strong: &[u32],
    dump: Option<&str>,
) -> Result<String> {
    let mut directory = String::new();
    if strong.is_empty() {
        return Ok(directory);
    }
    println!("freq lock phase_mse eq_mse | freq lock phase_mse eq_mse | cycle");

    for pair in strong.chunks(NUM_CHANNELS) {
        for (ch, &tvch) in pair.iter().enumerate() {
            if endpoint.freq(ch as u8) != Some(tvch) {
                print!(" {tvch:2}   --  ----      ----   | ");
                io::stdout().flush()?;
                endpoint.set_freq(ch as u8, tvch)?;
            }
        }

        let mut phase = vec![Phase::Locking; pair.len()];
        let mut started = vec![false; pair.len()];
        let mut aborted = false;

        for round in 0..100u32 {
            if phase.iter().all(|p| *p == Phase::Done) {
                break;
            }
            if round > 0 {
                print!("{} (any key to abort)", 100 - round);
                io::stdout().flush()?;
                if term::poll_key()?.is_some() {
                    aborted = true;
                    break;
                }
                thread::sleep(LOCK_POLL);
            }
            print!("\r\x1b[K");

            for (ch, &tvch) in pair.iter().enumerate() {
                match phase[ch] {
                    Phase::Locking => {
                        let st = endpoint.get_mse(ch as u8)?;
                        print!(
                            " {tvch:2}   {:2x}  {:4x}      {:4x}   | ",
                            st.status,
                            st.phase_mse >> 4,
                            st.eq_mse >> 4
                        );
                        if st.all_locks() {
                            phase[ch] = Phase::Streaming;
                        }
                    }
                    Phase::Streaming => {
                        print!(" {tvch:2} start {ch}                | ");
                        if !started[ch] {
                            if let Some(prefix) = dump {
                                let path = PathBuf::from(format!("{prefix}{tvch}.ts"));
                                endpoint.open_dump(ch as u8, &path)?;
                            }
                            endpoint.start_ts(ch as u8)?;
                            started[ch] = true;
                        }
                        if endpoint.vct(ch as u8).is_some() {
                            // hold the directory until every channel in the
                            // pair is finished
                            endpoint.stop_ts(ch as u8)?;
                            phase[ch] = Phase::Done;
                        }
                    }
                    Phase::Done => {
                        let st = endpoint.get_mse(ch as u8)?;
                        print!(
                            " {tvch:2} done{ch} {:4x}      {:4x}   | ",
                            st.phase_mse >> 4,
                            st.eq_mse >> 4
                        );
                    }
                }
            }
            io::stdout().flush()?;
        }
        println!();

        for (ch, &tvch) in pair.iter().enumerate() {
            if phase[ch] == Phase::Done {
                if let Some(text) = endpoint.vct(ch as u8) {
                    directory.push_str(&text);
                }
            } else {
                if started[ch] {
                    let _ = endpoint.stop_ts(ch as u8);
                }
                if !aborted {
                    warn!("channel {tvch} never produced a directory, skipping");
                }
            }
        }
        if aborted {
            break;
        }
    }
    Ok(directory)
}

/// Appliances live on 169.254/16; trim the constant prefix for display.
fn short_ip(addr: Ipv4Addr) -> String {
    let s = addr.to_string();
    s.strip_prefix("169.254").map(str::to_owned).unwrap_or(s)
}
