//! Daemon run loop: admit one instance, then serve control lines until `exit` or shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use pcm_player::PlaybackEngine;
use pcm_player::sink::DeviceBackend;

use crate::channel::{ChannelError, ControlChannel};
use crate::command::{CommandDispatcher, Flow};
use crate::config::DaemonConfig;
use crate::lifecycle::{DaemonFiles, InstanceLock, ShutdownToken};

/// Run the daemon with the backend named in `config`.
pub fn run(config: &DaemonConfig, shutdown: &ShutdownToken) -> Result<()> {
    run_with_backend(config, config.backend(), shutdown)
}

pub fn run_with_backend(
    config: &DaemonConfig,
    backend: Arc<dyn DeviceBackend>,
    shutdown: &ShutdownToken,
) -> Result<()> {
    let lock = InstanceLock::acquire(&config.lock_file)?;
    let mut files = DaemonFiles::write_pid(lock, &config.pid_file)?;
    let channel = ControlChannel::create(&config.fifo, config.max_line_len)
        .context("create control channel")?;
    files.own_fifo(channel.path());
    tracing::info!(
        pid = std::process::id(),
        fifo = %channel.path().display(),
        output = config.output.as_str(),
        buffer_ms = config.playback.buffer_ms,
        "daemon ready"
    );

    let engine = PlaybackEngine::new(backend, config.playback.clone());
    let mut dispatcher = CommandDispatcher::new(engine);
    let served = serve(&channel, &mut dispatcher, shutdown);
    dispatcher.shutdown();
    drop(files);
    served.context("control channel failed")?;
    tracing::info!("daemon exiting");
    Ok(())
}

/// Dispatch lines until `exit`, a shutdown request, or a channel failure.
pub fn serve(
    channel: &ControlChannel,
    dispatcher: &mut CommandDispatcher,
    shutdown: &ShutdownToken,
) -> Result<(), ChannelError> {
    for line in channel.lines(shutdown) {
        let line = line.inspect_err(|err| tracing::error!(error = %err, "control channel"))?;
        if dispatcher.dispatch(&line) == Flow::Exit {
            tracing::info!("exit requested");
            return Ok(());
        }
    }
    if shutdown.is_requested() {
        tracing::info!("shutdown requested");
    }
    Ok(())
}
