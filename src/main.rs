//! FISC simulator binary.
//!
//! Runs the server side of the FEP core from the command line: a
//! dual-port (or unified) switch simulator that answers network
//! management with "00" and financial requests with a configurable
//! approval code. See the `fiscgate` library for the core.

use anyhow::Result;
use clap::Parser;

use fiscgate::iso::field;
use fiscgate::{
    Endpoint, FiscServer, LengthEncoding, Message, MessageCodec, Mode, Mti, ServerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "fiscgate", about = "FISC switch simulator / bank-core server")]
struct Args {
    /// Listener host.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port at which client requests arrive (dual mode).
    #[arg(long, default_value_t = 9001)]
    receive_port: u16,

    /// Port through which responses leave (dual mode).
    #[arg(long, default_value_t = 9002)]
    send_port: u16,

    /// Run one unified listener on this port instead of two.
    #[arg(long)]
    unified_port: Option<u16>,

    /// Length prefix width in bytes (1-4).
    #[arg(long, default_value_t = 2)]
    length_width: usize,

    /// Length prefix encoding: ascii, bcd or binary.
    #[arg(long, default_value = "binary")]
    length_encoding: String,

    /// Length value includes the prefix bytes themselves.
    #[arg(long)]
    length_inclusive: bool,

    /// Delay every response by this many milliseconds.
    #[arg(long, default_value_t = 0)]
    response_delay_ms: u64,

    /// Disable institution-id routing (single-client bench setups).
    #[arg(long)]
    no_routing: bool,

    /// Response code for financial requests (field 39).
    #[arg(long, default_value = "00")]
    approval_code: String,
}

fn parse_length_encoding(name: &str) -> Result<LengthEncoding> {
    match name {
        "ascii" => Ok(LengthEncoding::Ascii),
        "bcd" => Ok(LengthEncoding::Bcd),
        "binary" => Ok(LengthEncoding::Binary),
        other => anyhow::bail!("unknown length encoding {other:?} (ascii, bcd or binary)"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match args.unified_port {
        Some(port) => ServerConfig::unified(Endpoint::new(args.host.clone(), port)),
        None => ServerConfig::dual(
            Endpoint::new(args.host.clone(), args.receive_port),
            Endpoint::new(args.host.clone(), args.send_port),
        ),
    };
    config.framer.length_width = args.length_width;
    config.framer.length_encoding = parse_length_encoding(&args.length_encoding)?;
    config.framer.length_inclusive = args.length_inclusive;
    config.response_delay_ms = args.response_delay_ms;
    config.routing_enabled = !args.no_routing;

    let server = FiscServer::start(config, MessageCodec::fisc()).await?;
    server.with_network_management_defaults();

    let approval = args.approval_code.clone();
    server.register_handler(Mti::FINANCIAL_REQUEST, move |request| {
        let mut response = Message::response_to(request);
        if let Some(code) = request.get_str(field::PROCESSING_CODE) {
            let code = code.to_string();
            response.set_str(field::PROCESSING_CODE, &code);
        }
        response.set_response_code(&approval);
        Ok(response)
    });
    server.register_handler(Mti::REVERSAL_REQUEST, |request| {
        let mut response = Message::response_to(request);
        response.set_response_code("00");
        Ok(response)
    });
    server.register_handler(Mti::AUTHORIZATION_REQUEST, |request| {
        let mut response = Message::response_to(request);
        response.set_response_code("00");
        Ok(response)
    });

    match config_summary(&server) {
        Some(summary) => log::info!("Simulator up: {summary}"),
        None => log::info!("Simulator up"),
    }

    tokio::signal::ctrl_c().await?;
    log::info!("Ctrl-C received, shutting down");
    server.shutdown();
    Ok(())
}

fn config_summary(server: &FiscServer) -> Option<String> {
    match (server.receive_addr(), server.send_addr(), server.unified_addr()) {
        (Some(receive), Some(send), _) => {
            Some(format!("receive {receive}, send {send} ({})", mode_label(Mode::Dual)))
        }
        (_, _, Some(unified)) => {
            Some(format!("unified {unified} ({})", mode_label(Mode::Unified)))
        }
        _ => None,
    }
}

fn mode_label(mode: Mode) -> &'static str {
    match mode {
        Mode::Dual => "dual-port",
        Mode::Unified => "unified",
    }
}
