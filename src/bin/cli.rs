use clap::Parser;
use mpegts_monitor::monitor::{run, Options};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Opt {
    /// UDP socket to bind + listen (IPv4)
    #[clap(long, default_value = "239.1.1.2:1234")]
    addr: String,

    /// Sampling period for aggregated analytics, milliseconds
    #[clap(long, default_value_t = 5000)]
    sampling_period: u64,

    /// Treat input as bare TS without RTP headers
    #[clap(long, default_value_t = false)]
    no_rtp: bool,

    /// Authoritative PCR PID (0 accepts any PCR-bearing PID)
    #[clap(long, default_value_t = 0)]
    pcr_pid: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let opt = Opt::parse();

    run(Options {
        addr: opt.addr.parse()?,
        sampling_period_ms: opt.sampling_period,
        rtp: !opt.no_rtp,
        pcr_pid: opt.pcr_pid,
    })
    .await
}
