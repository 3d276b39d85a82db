/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![deny(warnings)]

//! Device availability broker. Watches the kernel device model, keeps a
//! canonical table of present devices, answers queries over a Unix
//! control socket, and mirrors tagged devices into the init supervisor
//! as `device@<syspath>` services.

use std::os::unix::io::RawFd;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use device_source::DeviceSource;
use device_source::DummySource;
use device_source::UdevSource;
use dinit_client::Dinit;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::trace;
use slog::Drain;
use slog::Logger;
use structopt::StructOpt;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;

mod bridge;
mod broker;
mod config;
mod registry;
mod server;
mod table;
#[cfg(test)]
mod testutil;

use crate::broker::Broker;
use crate::config::Config;

#[derive(StructOpt)]
#[structopt(name = "devmond", no_version)]
struct Opts {
    /// Inherited pipe to write READY=1 to once the control socket is
    /// listening
    readiness_fd: Option<RawFd>,
}

fn main() -> Result<()> {
    let log = root_logger();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("while building the runtime")?;
    let local = tokio::task::LocalSet::new();
    match local.block_on(&runtime, run(Opts::from_args(), log.clone())) {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(log, "{:#}", e);
            Err(e)
        }
    }
}

fn root_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build();
    Logger::root(std::sync::Mutex::new(drain).fuse(), o!())
}

async fn run(opts: Opts, log: Logger) -> Result<()> {
    let cfg = Config::from_env().context("invalid environment")?;
    debug!(log, "configuration: {:?}", cfg);

    let (dinit, mut supervisor_events) = match cfg.supervisor_fd {
        Some(fd) => Dinit::from_fd(log.clone(), fd).await,
        None => Dinit::connect(log.clone(), dinit_client::DEFAULT_SOCKET).await,
    }
    .context("while establishing the supervisor session")?;

    let root = dinit
        .load_service(&cfg.system_service, true)
        .await
        .context("while loading the root service")?
        .map(|(handle, _)| handle)
        .with_context(|| format!("root service {:?} does not exist", cfg.system_service))?;

    let mut source: Box<dyn DeviceSource> = if cfg.dummy_mode {
        info!(log, "running in dummy mode; no devices will be tracked");
        Box::new(DummySource)
    } else {
        Box::new(UdevSource::new(log.clone()).context("while opening the device monitors")?)
    };

    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let core = Broker::new(log.clone(), dinit, root, fatal_tx);

    for (class, desc) in source
        .enumerate()
        .context("while enumerating attached devices")?
    {
        broker::handle_event(&core, class, &desc, true);
    }

    let listener = server::bind_control_socket(Path::new(config::CONTROL_SOCKET_PATH))
        .context("while binding the control socket")?;
    if let Some(fd) = opts.readiness_fd {
        notify_readiness(fd).context("while signalling readiness")?;
    }
    info!(log, "listening on {}", config::CONTROL_SOCKET_PATH);

    tokio::task::spawn_local(server::serve(core.clone(), listener));
    {
        let core = core.clone();
        tokio::task::spawn_local(async move {
            loop {
                match source.next_event().await {
                    Ok((class, desc)) => broker::handle_event(&core, class, &desc, false),
                    Err(e) => {
                        let broker = core.borrow();
                        let _ = broker
                            .fatal_tx
                            .send(anyhow::Error::new(e).context("device monitor failed"));
                        return;
                    }
                }
            }
        });
    }
    {
        // keep the session queue drained; the broker only traces these
        let log = log.clone();
        tokio::task::spawn_local(async move {
            while let Some((handle, event)) = supervisor_events.recv().await {
                trace!(log, "supervisor event {:?} for {:?}", event, handle);
            }
        });
    }

    let mut sigterm = signal(SignalKind::terminate()).context("while installing SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("while installing SIGINT")?;
    tokio::select! {
        _ = sigterm.recv() => {
            info!(log, "received SIGTERM, shutting down");
            Ok(())
        }
        _ = sigint.recv() => {
            info!(log, "received SIGINT, shutting down");
            Ok(())
        }
        fatal = fatal_rx.recv() => {
            Err(fatal.unwrap_or_else(|| anyhow::anyhow!("event loop ended unexpectedly")))
        }
    }
}

fn notify_readiness(fd: RawFd) -> Result<()> {
    nix::unistd::write(fd, b"READY=1\n").context("readiness write failed")?;
    nix::unistd::close(fd).context("closing the readiness fd failed")?;
    Ok(())
}
