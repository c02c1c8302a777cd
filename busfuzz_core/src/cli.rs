use crate::dcm::{self, DcmDriver};
use crate::discover::{self, DiscoveryRange};
use crate::error::{CanFuzzError, CanFuzzResult};
use crate::frame::Frame;
use crate::fuzz::engine::{FuzzEngine, RandomOpts, stdin_judge};
use crate::fuzz::stats::Stats;
use crate::lenattack::{self, LenAttackOpts, PayloadPattern};
use crate::mask::NibbleMask;
use crate::mutator::Mutator;
use crate::session::{BusConfig, Session, SessionLog};
use crate::traits::Transport;
use crate::xcp::{XcpDriver, ihex};
use clap::Parser;
use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;

fn parse_num(text: &str) -> Result<u32, String> {
    crate::codec::parse_number(text).map_err(|err| err.to_string())
}

fn parse_num_u8(text: &str) -> Result<u8, String> {
    let value = parse_num(text)?;
    u8::try_from(value).map_err(|_| format!("{text} does not fit into a byte"))
}

fn parse_num_u64(text: &str) -> Result<u64, String> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        text.parse::<u64>()
    }
    .map_err(|_| format!("{text} is not a decimal or 0x-prefixed hex number"))
}

#[derive(Debug, Parser)]
#[command(name = "busfuzz", about = "CAN bus fuzzing and diagnostics toolkit")]
struct CanFuzzCliArgs {
    /// CAN channel to use
    #[arg(long, short, default_value = "can0")]
    interface: String,
    /// Verbose mode
    #[arg(long, default_value_t = false)]
    verbose: bool,
    /// Session log every transmitted and received frame is appended to
    #[arg(long, short = 'l', default_value = "busfuzz-session.log")]
    log_file: PathBuf,
    /// Diagnostic response timeout in milliseconds
    #[arg(long, default_value_t = 500)]
    timeout: u64,
    /// Discovery probe timeout in milliseconds
    #[arg(long, default_value_t = 200)]
    probe_timeout: u64,
    #[command(subcommand)]
    command: CanFuzzCliCommands,
}

#[derive(Debug, Subcommand)]
enum CanFuzzCliCommands {
    /// Fuzz the bus with generated, mutated or replayed frames
    Fuzzer {
        #[command(subcommand)]
        mode: FuzzerMode,
    },
    /// UDS/DCM diagnostics: discovery, service scan, sub-functions, DTCs
    Dcm {
        #[command(subcommand)]
        command: DcmCommand,
    },
    /// XCP: slave discovery, connection info, memory dump
    Xcp {
        #[command(subcommand)]
        command: XcpCommand,
    },
    /// Transmit message literals or replay a recorded file
    Send {
        #[command(subcommand)]
        command: SendCommand,
    },
    /// Passively count arbitration IDs until interrupted
    Listener {
        /// Reversed sorting of results
        #[arg(long, short)]
        reverse: bool,
    },
    /// Length attack: DLC sweeps with patterned payloads
    Lenattack {
        /// Target IDs: plain, ranges like 0x100-0x1ff, or `any`
        #[arg(required = true)]
        targets: Vec<String>,
        /// Minimum DLC value to try
        #[arg(long, default_value_t = 0)]
        min_dlc: u8,
        /// Maximum DLC value to try
        #[arg(long, default_value_t = 8)]
        max_dlc: u8,
        /// Probability of mismatching payload length and DLC
        #[arg(long, default_value_t = 0.5)]
        mismatch_prob: f64,
        /// Payload pattern: rand|zeros|ffs|aa|55|inc|custom:<hex>
        #[arg(long, default_value = "inc")]
        pattern: PayloadPattern,
        /// Interval between sends in milliseconds
        #[arg(long, default_value_t = 50)]
        interval: u64,
        /// Frames to send per DLC step
        #[arg(long, default_value_t = 1)]
        bursts: u32,
        /// Repeat the sweep until interrupted
        #[arg(long)]
        repeat: bool,
        /// Start byte for the `inc` pattern
        #[arg(long, value_parser = parse_num_u8, default_value = "0")]
        start_byte: u8,
        /// Seed for reproducible runs
        #[arg(long, short, value_parser = parse_num_u64)]
        seed: Option<u64>,
    },
}

#[derive(Debug, Subcommand)]
enum FuzzerMode {
    /// Emit frames with uniformly random ID and payload
    Random {
        /// Lowest arbitration ID to draw
        #[arg(long, value_parser = parse_num, default_value = "0x0")]
        min_id: u32,
        /// Highest arbitration ID to draw
        #[arg(long, value_parser = parse_num, default_value = "0x7ff")]
        max_id: u32,
        /// Shortest payload to draw
        #[arg(long, default_value_t = 0)]
        min_len: usize,
        /// Longest payload to draw
        #[arg(long, default_value_t = 8)]
        max_len: usize,
        /// Stop after this many frames instead of running until interrupted
        #[arg(long, short = 'n')]
        count: Option<u64>,
        /// Delay between frames in milliseconds
        #[arg(long, short, default_value_t = 10)]
        delay: u64,
        /// Seed for reproducible runs
        #[arg(long, short, value_parser = parse_num_u64)]
        seed: Option<u64>,
    },
    /// Enumerate every combination of a mask's free nibbles
    Brute {
        /// Base message with `.` wildcards, e.g. 0x24.#a6.0.00
        mask: String,
        /// Delay between frames in milliseconds
        #[arg(long, short, default_value_t = 10)]
        delay: u64,
    },
    /// Re-draw a mask's free nibbles at random for every frame
    Mutate {
        /// Base message with `.` wildcards
        mask: String,
        /// Stop after this many frames instead of running until interrupted
        #[arg(long, short = 'n')]
        count: Option<u64>,
        /// Delay between frames in milliseconds
        #[arg(long, short, default_value_t = 10)]
        delay: u64,
        /// Seed for reproducible runs
        #[arg(long, short, value_parser = parse_num_u64)]
        seed: Option<u64>,
    },
    /// Retransmit a session log in original order
    Replay {
        /// Log file to replay
        file: PathBuf,
        /// Replace every recorded delay with this many milliseconds
        #[arg(long, short)]
        delay: Option<u64>,
    },
    /// Replay a log directive by directive and bisect to the one causing an
    /// observed effect
    Identify {
        /// Log file to bisect
        file: PathBuf,
        /// Replace every recorded delay with this many milliseconds
        #[arg(long, short)]
        delay: Option<u64>,
    },
}

#[derive(Debug, Subcommand)]
enum DcmCommand {
    /// Scan an ID range for diagnostics responders
    Discovery {
        /// First ID to probe
        #[arg(long, value_parser = parse_num, default_value = "0x0")]
        min: u32,
        /// Last ID to probe
        #[arg(long, value_parser = parse_num, default_value = "0x7ff")]
        max: u32,
        /// IDs to exclude from probing
        #[arg(long, value_parser = parse_num, num_args = 0..)]
        blacklist: Vec<u32>,
        /// Listen this many seconds first and blacklist everything seen
        /// broadcasting
        #[arg(long)]
        autoblacklist: Option<u64>,
        /// Scan the whole range instead of stopping at the first responder
        #[arg(long)]
        nostop: bool,
    },
    /// Probe which UDS services an endpoint supports
    Services {
        /// Arbitration ID requests are sent on
        #[arg(value_parser = parse_num)]
        src: u32,
        /// Arbitration ID responses arrive on
        #[arg(value_parser = parse_num)]
        dst: u32,
    },
    /// Probe sub-function bytes of one service
    Subfunc {
        /// Arbitration ID requests are sent on
        #[arg(value_parser = parse_num)]
        src: u32,
        /// Arbitration ID responses arrive on
        #[arg(value_parser = parse_num)]
        dst: u32,
        /// Service identifier
        #[arg(value_parser = parse_num_u8)]
        service: u8,
        /// Sub-function bytes to probe
        #[arg(required = true, value_parser = parse_num_u8)]
        subfuncs: Vec<u8>,
        /// Print the data returned by positive responses
        #[arg(long)]
        show: bool,
    },
    /// Read (and optionally clear) stored diagnostic trouble codes
    Dtc {
        /// Arbitration ID requests are sent on
        #[arg(value_parser = parse_num)]
        src: u32,
        /// Arbitration ID responses arrive on
        #[arg(value_parser = parse_num)]
        dst: u32,
        /// Clear the stored DTCs after reading them
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Debug, Subcommand)]
enum XcpCommand {
    /// Scan an ID range for XCP slaves
    Discovery {
        /// First ID to probe
        #[arg(long, value_parser = parse_num, default_value = "0x0")]
        min: u32,
        /// Last ID to probe
        #[arg(long, value_parser = parse_num, default_value = "0x7ff")]
        max: u32,
        /// IDs to exclude from probing
        #[arg(long, value_parser = parse_num, num_args = 0..)]
        blacklist: Vec<u32>,
        /// Listen this many seconds first and blacklist everything seen
        /// broadcasting
        #[arg(long)]
        autoblacklist: Option<u64>,
        /// Scan the whole range instead of stopping at the first responder
        #[arg(long)]
        nostop: bool,
    },
    /// Connect and report resource and protection information
    Info {
        /// Arbitration ID commands are sent on
        #[arg(value_parser = parse_num)]
        src: u32,
        /// Arbitration ID replies arrive on
        #[arg(value_parser = parse_num)]
        dst: u32,
    },
    /// Dump a memory region as Intel-hex
    Dump {
        /// Arbitration ID commands are sent on
        #[arg(value_parser = parse_num)]
        src: u32,
        /// Arbitration ID replies arrive on
        #[arg(value_parser = parse_num)]
        dst: u32,
        /// First address to read
        #[arg(value_parser = parse_num)]
        start: u32,
        /// Number of bytes to read
        #[arg(value_parser = parse_num)]
        length: u32,
        /// Write the Intel-hex output here instead of stdout
        #[arg(long, short)]
        file: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
enum SendCommand {
    /// Parse and transmit message literals like 0x7e0#c0.ff.ee
    Message {
        /// Messages in ARB_ID#DATA syntax
        #[arg(required = true)]
        messages: Vec<String>,
        /// Zero-pad every payload to the full 8 bytes
        #[arg(long)]
        pad: bool,
        /// Delay between messages in milliseconds
        #[arg(long, short, default_value_t = 0)]
        delay: u64,
    },
    /// Replay a candump file without fuzz bookkeeping
    File {
        /// Log file to send
        file: PathBuf,
        /// Replace every recorded delay with this many milliseconds
        #[arg(long, short)]
        delay: Option<u64>,
    },
}

/// A helper struct to set up the CLI application with fewer lines of code.
/// The factory builds the transport for the channel named on the command
/// line.
pub struct CanFuzzBuilder<T: Transport, F: FnOnce(&str) -> T> {
    transport_factory: F,
}

impl<T: Transport, F: FnOnce(&str) -> T> CanFuzzBuilder<T, F> {
    /// Generates a new instance of `CanFuzzBuilder`
    pub fn new(transport_factory: F) -> Self {
        Self { transport_factory }
    }

    /// Starts `busfuzz` as a CLI application: parses arguments, opens the
    /// transport and session log, installs the interrupt handler and
    /// dispatches to the selected module.
    /// # Errors
    pub async fn start_cli(self) -> Result<(), CanFuzzError> {
        let args = CanFuzzCliArgs::parse();
        crate::log::init(args.verbose);

        let mut transport = (self.transport_factory)(&args.interface);
        transport.open().await?;

        let config = BusConfig {
            response_timeout: Duration::from_millis(args.timeout),
            probe_timeout: Duration::from_millis(args.probe_timeout),
            ..BusConfig::default()
        };
        let log = SessionLog::open(&args.log_file, &args.interface)?;
        let mut session = Session::new(transport, log, config);

        // flipped by Ctrl+C; every loop checks it at its iteration boundary
        // and the session log is flushed per append, so nothing is lost on
        // a graceful interrupt
        let stop = Arc::new(AtomicBool::new(false));
        {
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, finishing up");
                    stop.store(true, Ordering::Relaxed);
                }
            });
        }

        let result = dispatch(&mut session, args.command, &args.log_file, &stop).await;
        let _ = session.transport.close().await;
        result
    }
}

fn manifest_path(log_file: &Path) -> PathBuf {
    log_file.with_extension("meta.json")
}

fn save_manifest(stats: &Stats, log_file: &Path) -> CanFuzzResult<()> {
    let path = manifest_path(log_file);
    stats.save(&path)?;
    tracing::info!("run manifest written to {}", path.display());
    Ok(())
}

#[allow(clippy::too_many_lines)]
async fn dispatch<T: Transport>(
    session: &mut Session<T>,
    command: CanFuzzCliCommands,
    log_file: &Path,
    stop: &AtomicBool,
) -> CanFuzzResult<()> {
    match command {
        CanFuzzCliCommands::Fuzzer { mode } => fuzzer(session, mode, log_file, stop).await,
        CanFuzzCliCommands::Dcm { command } => dcm_module(session, command, stop).await,
        CanFuzzCliCommands::Xcp { command } => xcp_module(session, command, stop).await,
        CanFuzzCliCommands::Send { command } => send_module(session, command, stop).await,
        CanFuzzCliCommands::Listener { reverse } => {
            let hits = discover::listen(&mut session.transport, stop).await?;
            if hits.is_empty() {
                println!("No arbitration IDs were detected.");
                return Ok(());
            }
            println!("\nDetected arbitration IDs:");
            let mut sorted: Vec<(u32, u64)> = hits.into_iter().collect();
            sorted.sort_by_key(|(_, count)| *count);
            if reverse {
                sorted.reverse();
            }
            for (id, count) in sorted {
                println!("Arb id 0x{id:08x} {count} hits");
            }
            Ok(())
        }
        CanFuzzCliCommands::Lenattack {
            targets,
            min_dlc,
            max_dlc,
            mismatch_prob,
            pattern,
            interval,
            bursts,
            repeat,
            start_byte,
            seed,
        } => {
            let seed = seed.unwrap_or_else(rand::random);
            tracing::info!("seed 0x{seed:016x}");
            let opts = LenAttackOpts {
                targets: lenattack::parse_targets(&targets)?,
                min_dlc,
                max_dlc,
                mismatch_prob: mismatch_prob.clamp(0.0, 1.0),
                pattern,
                interval: Duration::from_millis(interval),
                bursts: bursts.max(1),
                repeat,
                start_byte,
            };
            let mut mutator = Mutator::from_seed(seed);
            let sent = lenattack::run(session, &mut mutator, &opts, stop).await?;
            tracing::info!("length attack done, {sent} frames sent");
            Ok(())
        }
    }
}

async fn fuzzer<T: Transport>(
    session: &mut Session<T>,
    mode: FuzzerMode,
    log_file: &Path,
    stop: &AtomicBool,
) -> CanFuzzResult<()> {
    match mode {
        FuzzerMode::Random {
            min_id,
            max_id,
            min_len,
            max_len,
            count,
            delay,
            seed,
        } => {
            let seed = seed.unwrap_or_else(rand::random);
            let mut engine = FuzzEngine::new(session, "fuzzer random", seed, stop);
            let opts = RandomOpts {
                min_id,
                max_id,
                min_len,
                max_len,
                count,
            };
            engine.random(&opts, Duration::from_millis(delay)).await?;
            save_manifest(&engine.into_stats(), log_file)
        }
        FuzzerMode::Brute { mask, delay } => {
            let mask = NibbleMask::parse(&mask)?;
            let mut engine = FuzzEngine::unseeded(session, "fuzzer brute", stop);
            engine.brute(&mask, Duration::from_millis(delay)).await?;
            save_manifest(&engine.into_stats(), log_file)
        }
        FuzzerMode::Mutate {
            mask,
            count,
            delay,
            seed,
        } => {
            let mask = NibbleMask::parse(&mask)?;
            let seed = seed.unwrap_or_else(rand::random);
            let mut engine = FuzzEngine::new(session, "fuzzer mutate", seed, stop);
            engine
                .mutate(&mask, count, Duration::from_millis(delay))
                .await?;
            save_manifest(&engine.into_stats(), log_file)
        }
        FuzzerMode::Replay { file, delay } => {
            let directives = SessionLog::load(&file)?;
            let mut engine = FuzzEngine::unseeded(session, "fuzzer replay", stop);
            engine
                .replay(&directives, delay.map(Duration::from_millis))
                .await?;
            save_manifest(&engine.into_stats(), log_file)
        }
        FuzzerMode::Identify { file, delay } => {
            let directives = SessionLog::load(&file)?;
            let mut engine = FuzzEngine::unseeded(session, "fuzzer identify", stop);
            let culprit = engine
                .identify(
                    directives,
                    delay.map(Duration::from_millis),
                    &mut stdin_judge(),
                )
                .await?;
            match culprit {
                Some(directive) => println!("implicated directive: {}", directive.frame),
                None => println!("no single directive implicated"),
            }
            save_manifest(&engine.into_stats(), log_file)
        }
    }
}

async fn dcm_module<T: Transport>(
    session: &mut Session<T>,
    command: DcmCommand,
    stop: &AtomicBool,
) -> CanFuzzResult<()> {
    match command {
        DcmCommand::Discovery {
            min,
            max,
            blacklist,
            autoblacklist,
            nostop,
        } => {
            let mut range = DiscoveryRange {
                min,
                max,
                blacklist: blacklist.into_iter().collect(),
                nostop,
            };
            if let Some(secs) = autoblacklist {
                let seen =
                    discover::autoblacklist(session, Duration::from_secs(secs)).await?;
                range.blacklist.extend(seen);
            }
            let found = discover::scan(
                session,
                &range,
                &dcm::DISCOVERY_PROBE,
                dcm::is_diagnostic_response,
                stop,
            )
            .await?;
            if found.is_empty() {
                tracing::info!("no diagnostics responder found");
            }
            for id in found {
                tracing::info!("diagnostics found at {id:#06x}");
            }
            Ok(())
        }
        DcmCommand::Services { src, dst } => {
            let supported = DcmDriver::new(session, src, dst).services().await?;
            tracing::info!("{} of {} services supported", supported.len(), dcm::UDS_SERVICES.len());
            Ok(())
        }
        DcmCommand::Subfunc {
            src,
            dst,
            service,
            subfuncs,
            show,
        } => {
            DcmDriver::new(session, src, dst)
                .subfunc(service, &subfuncs, show)
                .await?;
            Ok(())
        }
        DcmCommand::Dtc { src, dst, clear } => {
            DcmDriver::new(session, src, dst).dtc(clear).await?;
            Ok(())
        }
    }
}

async fn xcp_module<T: Transport>(
    session: &mut Session<T>,
    command: XcpCommand,
    stop: &AtomicBool,
) -> CanFuzzResult<()> {
    match command {
        XcpCommand::Discovery {
            min,
            max,
            blacklist,
            autoblacklist,
            nostop,
        } => {
            let mut range = DiscoveryRange {
                min,
                max,
                blacklist: blacklist.into_iter().collect(),
                nostop,
            };
            if let Some(secs) = autoblacklist {
                let seen =
                    discover::autoblacklist(session, Duration::from_secs(secs)).await?;
                range.blacklist.extend(seen);
            }
            let found = discover::scan(
                session,
                &range,
                &crate::xcp::DISCOVERY_PROBE,
                crate::xcp::is_xcp_response,
                stop,
            )
            .await?;
            if found.is_empty() {
                tracing::info!("no XCP slave found");
            }
            for id in found {
                tracing::info!("XCP slave found at {id:#06x}");
            }
            Ok(())
        }
        XcpCommand::Info { src, dst } => XcpDriver::new(session, src, dst).info().await,
        XcpCommand::Dump {
            src,
            dst,
            start,
            length,
            file,
        } => {
            let bytes = XcpDriver::new(session, src, dst).dump(start, length).await?;
            match file {
                Some(path) => {
                    let mut out = std::fs::File::create(&path)?;
                    ihex::write_hex(&mut out, start, &bytes)?;
                    tracing::info!("wrote {} bytes to {}", bytes.len(), path.display());
                }
                None => {
                    let mut stdout = std::io::stdout().lock();
                    ihex::write_hex(&mut stdout, start, &bytes)?;
                }
            }
            Ok(())
        }
    }
}

async fn send_module<T: Transport>(
    session: &mut Session<T>,
    command: SendCommand,
    stop: &AtomicBool,
) -> CanFuzzResult<()> {
    match command {
        SendCommand::Message {
            messages,
            pad,
            delay,
        } => {
            // validate everything before touching the bus
            let mut frames = Vec::new();
            for literal in &messages {
                let frame = crate::codec::parse_message_literal(literal)?;
                frames.push(if pad { frame.padded() } else { frame });
            }
            for frame in &frames {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                session.send(frame).await?;
                tracing::info!("sent {frame}");
                sleep(Duration::from_millis(delay)).await;
            }
            Ok(())
        }
        SendCommand::File { file, delay } => {
            let directives = SessionLog::load(&file)?;
            tracing::info!("sending {} frames from {}", directives.len(), file.display());
            for directive in &directives {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                sleep(
                    delay
                        .map(Duration::from_millis)
                        .unwrap_or(directive.delay_since_previous),
                )
                .await;
                let frame = Frame::new(
                    directive.frame.id(),
                    directive.frame.data(),
                    crate::frame::Direction::Sent,
                )?;
                session.send(&frame).await?;
                tracing::info!("sent {frame}");
            }
            Ok(())
        }
    }
}
