use busfuzz_common::transport::socketcan::SocketCanTransport;
use busfuzz_core::cli::CanFuzzBuilder;

#[tokio::main]
async fn main() {
    // The transport for the channel named with -i/--interface. Everything
    // else (argument parsing, logging, session setup, dispatch) lives in
    // busfuzz_core.
    let builder = CanFuzzBuilder::new(SocketCanTransport::new);

    if let Err(err) = builder.start_cli().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
