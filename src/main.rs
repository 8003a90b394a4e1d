//! `tensor-query` server binary.
//!
//! Runs a TCP server source with an attached sink, rendering frames until
//! interrupted.

mod cli;

use std::{error::Error, io, process::ExitCode, sync::Arc, thread};

use clap::Parser;
use log::{error, info, warn};
use tensor_query::{
    CapsQuery,
    PushSource,
    ServerRegistry,
    ServerSource,
    ServerSrcError,
    ShutdownHandle,
    TensorSink,
};

fn main() -> ExitCode {
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let cli = cli::Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("tensor-query failed: error={e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &cli::Cli) -> Result<(), Box<dyn Error>> {
    let config = cli.to_config()?;

    #[cfg(feature = "metrics")]
    if let Some(addr) = cli.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!("serving metrics: addr={addr}");
    }

    let registry = ServerRegistry::global();
    let sink = Arc::new(TensorSink::new(cli.caps.clone()).silent(cli.silent));
    sink.attach(&registry, &config)?;

    let downstream: Arc<dyn CapsQuery> = sink.clone();
    let mut source = ServerSource::new(config, registry, downstream)?;
    spawn_signal_thread(source.shutdown_handle())?;

    source.start()?;
    loop {
        match source.create() {
            Ok(frame) => sink.render(&frame),
            Err(ServerSrcError::Flushing) => break,
            Err(e) if e.is_recoverable() => warn!("frame dropped: error={e}"),
            Err(e) => return Err(e.into()),
        }
    }
    source.stop();
    info!("frames rendered: count={}", sink.rendered());
    Ok(())
}

fn spawn_signal_thread(handle: ShutdownHandle) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    thread::Builder::new()
        .name("tensor-query-signal".into())
        .spawn(move || {
            if let Err(e) = runtime.block_on(tokio::signal::ctrl_c()) {
                error!("failed to listen for interrupt: error={e}");
                return;
            }
            info!("interrupt received; shutting down");
            handle.shutdown();
        })?;
    Ok(())
}
