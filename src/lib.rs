pub mod monitor {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use tokio::net::UdpSocket;
    use tracing::info;

    use crate::analyzer::Analyzer;
    use crate::constants::DEFAULT_RING_CAPACITY;
    use crate::network::{create_udp_socket, receive_loop};
    use crate::ring_buffer::RingBuffer;
    use crate::types::AnalyzerConfig;

    pub struct Options {
        pub addr: SocketAddr,
        /// Sampling period of aggregated analytics in milliseconds
        pub sampling_period_ms: u64,
        /// Whether inbound frames carry RTP headers ahead of the TS payload
        pub rtp: bool,
        /// Authoritative PCR PID; 0 accepts any PCR-bearing PID
        pub pcr_pid: u16,
    }

    /// Async entry-point; returns when stopped (Ctrl-C or socket error)
    pub async fn run(opts: Options) -> anyhow::Result<()> {
        let ring = Arc::new(RingBuffer::new(DEFAULT_RING_CAPACITY));

        let config = AnalyzerConfig {
            sampling_period_ms: opts.sampling_period_ms,
            has_rtp_headers: opts.rtp,
            selected_pcr_pid: opts.pcr_pid,
            source_label: opts.addr.ip().to_string(),
            source_port: opts.addr.port(),
            ..AnalyzerConfig::default()
        };
        let mut analyzer = Analyzer::new(config, Arc::clone(&ring));
        analyzer.start();

        let socket = create_udp_socket(&opts.addr)?;
        let sock = UdpSocket::from_std(socket.into())?;
        info!(addr = %opts.addr, "listening for transport stream");

        let result = tokio::select! {
            res = receive_loop(sock, Arc::clone(&ring), || analyzer.note_dropped_frame()) => res,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                Ok(())
            }
        };

        // drains buffered frames and joins the worker threads
        analyzer.stop();
        result
    }
}

pub mod analyzer;
pub mod constants;
pub mod metrics;
pub mod network;
pub mod packet_factory;
pub mod ring_buffer;
pub mod types;
