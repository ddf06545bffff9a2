use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;
use venc::encoder::{ReplayChannel, ReplayEncoder};
use venc::{
    ChannelConfig, Codec, Dispatcher, Multiplexer, OutputMode, StreamConfig, Streamer,
};

/// IPv4 + UDP + RTP header bytes subtracted from `--mtu`. The smallest
/// accepted MTU (56) leaves the minimum 16-byte payload budget.
const PACKET_OVERHEAD: usize = 20 + 8 + 12;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Write raw elementary streams to files
    File,
    /// Send RTP over UDP
    Rtp,
}

impl From<Mode> for OutputMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::File => OutputMode::File,
            Mode::Rtp => OutputMode::Rtp,
        }
    }
}

fn parse_codec(s: &str) -> Result<Codec, String> {
    s.parse().map_err(|e: venc::StreamError| e.to_string())
}

#[derive(Parser)]
#[command(
    name = "venc-stream",
    about = "Stream encoded video channels to files or over RTP/UDP"
)]
struct Args {
    /// Output mode
    #[arg(long, short, value_enum, default_value = "rtp")]
    mode: Mode,

    /// Codec of every input: 264, 265, mjpeg or jpeg
    #[arg(long, short, value_parser = parse_codec, default_value = "264")]
    codec: Codec,

    /// Frame rate of the replayed channels
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u32).range(1..=30))]
    fps: u32,

    /// RTP receiver address
    #[arg(long, default_value = "192.168.1.100")]
    ip: IpAddr,

    /// RTP receiver port
    #[arg(long, short, default_value_t = 1234)]
    port: u16,

    /// Send one packet per NAL unit instead of aggregating
    #[arg(long)]
    no_aggregation: bool,

    /// Path MTU; the RTP payload budget is derived from it
    #[arg(long, default_value_t = 1440, value_parser = clap::value_parser!(u16).range(56..))]
    mtu: u16,

    /// Directory for file output
    #[arg(long, short, default_value = ".")]
    output_dir: PathBuf,

    /// Restart each input at end of file
    #[arg(long = "loop")]
    looping: bool,

    /// Elementary stream files, one channel each
    #[arg(long, short, required = true, num_args = 1..)]
    input: Vec<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("venc-stream: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> venc::Result<()> {
    let config = StreamConfig {
        destination: Some(SocketAddr::new(args.ip, args.port)),
        frame_rate: args.fps,
        aggregation: !args.no_aggregation,
        payload_budget: usize::from(args.mtu).saturating_sub(PACKET_OVERHEAD),
        output_dir: args.output_dir.clone(),
        ..StreamConfig::default()
    };
    config.validate()?;

    let output = OutputMode::from(args.mode);
    let channels: Vec<ChannelConfig> = (0u32..)
        .zip(&args.input)
        .map(|(id, _)| ChannelConfig::new(id, args.codec, output))
        .collect();
    config.validate_channels(&channels)?;

    tracing::info!(
        inputs = args.input.len(),
        codec = %args.codec,
        looping = args.looping,
        "opening replay channels"
    );
    let mux = Multiplexer::new();
    let mut replay = Vec::with_capacity(channels.len());
    for (channel, path) in channels.iter().zip(&args.input) {
        let handle = mux.register(channel.id)?;
        replay.push(ReplayChannel::open(
            path,
            channel.codec,
            args.fps,
            args.looping,
            handle,
        )?);
    }
    let encoder = ReplayEncoder::start(replay)?;
    let dispatcher = Dispatcher::open(config.clone(), &channels, encoder, mux)?;

    println!("mode:        {:?}", args.mode);
    println!("codec:       {}", args.codec);
    println!("channels:    {}", channels.len());
    println!("fps:         {}", config.frame_rate);
    match output {
        OutputMode::Rtp => {
            if let Some(dest) = config.destination {
                println!("destination: {dest}");
            }
            println!("aggregation: {}", config.aggregation);
            println!("payload:     {} bytes", config.payload_budget);
        }
        OutputMode::File => println!("output dir:  {}", config.output_dir.display()),
    }

    let mut streamer = Streamer::new();
    streamer.start(dispatcher)?;

    println!("streaming, press Enter to stop");
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;

    streamer.stop();
    let stats = streamer.join()?;
    println!("{stats}");
    Ok(())
}
