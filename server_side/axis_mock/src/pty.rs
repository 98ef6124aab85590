//! A pseudo-terminal pair, made with `socat`, with the mock axes listening on
//! one end. The coordinator can then be started with `--port` pointing at the
//! other end as if it were real hardware.
use std::{
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tempdir::TempDir;
use tokio::{
    io::{split, ReadHalf, WriteHalf},
    join,
    process::{Child, Command},
    sync::oneshot,
};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{info, warn};

const CREATION_RETRIES: usize = 10;

async fn wait_for_file_once(path: &Path) -> Result<()> {
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("invalid path: {:?}", path))?
        .to_owned();
    let directory = path.parent().ok_or_else(|| anyhow!("invalid path: {:?}", path))?;
    let (sender, receiver) = oneshot::channel();
    let mut sender = Some(sender);
    let mut watcher = RecommendedWatcher::new(
        move |event: notify::Result<notify::Event>| {
            let Ok(event) = event else { return };
            let created = matches!(event.kind, EventKind::Create(_))
                && event.paths.iter().any(|path| path.ends_with(&name));
            if created {
                if let Some(sender) = sender.take() {
                    drop(sender.send(()));
                }
            }
        },
        notify::Config::default(),
    )?;
    watcher.watch(directory, RecursiveMode::NonRecursive)?;
    // The watcher is live; anything created from here on is seen.
    if path.exists() {
        return Ok(());
    }
    receiver
        .await
        .map_err(|_| anyhow!("watcher stopped before {:?} appeared", path))
}

async fn wait_for_file(path: &Path) -> Result<()> {
    let mut attempts = 0;
    loop {
        match wait_for_file_once(path).await {
            Ok(()) => return Ok(()),
            Err(e) if attempts < CREATION_RETRIES => {
                attempts += 1;
                warn!("still waiting for {:?}: {:#}", path, e);
            }
            Err(e) => return Err(e),
        }
    }
}

/// socat only removes its links when interrupted, not when killed.
async fn interrupt(mut child: Child) -> Result<()> {
    if let Some(pid) = child.id() {
        Command::new("kill")
            .arg("-2")
            .arg(pid.to_string())
            .status()
            .await
            .context("sending SIGINT to socat")?;
    }
    child.wait().await?;
    Ok(())
}

pub fn open_port(path: &Path) -> Result<(ReadHalf<SerialStream>, WriteHalf<SerialStream>)> {
    let port = tokio_serial::new(path.to_string_lossy(), 115200)
        .data_bits(DataBits::Eight)
        .flow_control(FlowControl::None)
        .timeout(Duration::from_millis(30))
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .open_native_async()
        .with_context(|| format!("opening {:?}", path))?;
    Ok(split(port))
}

pub struct PtyBus {
    path: PathBuf,
    halt: oneshot::Sender<()>,
    done: oneshot::Receiver<()>,
}

impl PtyBus {
    /// The end to hand to the coordinator.
    pub fn path(&self) -> &Path {
        &self.path
    }
    /// Stops the served task and socat, and removes the links.
    pub async fn close(self) {
        let PtyBus { halt, done, .. } = self;
        drop(halt);
        drop(done.await);
    }
}

/// Must be called from within a tokio runtime.
pub async fn serve_on_pty<F, Fut>(serve: F) -> Result<PtyBus>
where
    F: FnOnce(ReadHalf<SerialStream>, WriteHalf<SerialStream>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let directory = TempDir::new("axis-bus")?;
    let host_path = directory.path().join("coordinator");
    let axes_path = directory.path().join("axes");
    let socat = Command::new("socat")
        .arg(format!("pty,raw,echo=0,link={}", host_path.to_string_lossy()))
        .arg(format!("pty,raw,echo=0,link={}", axes_path.to_string_lossy()))
        .kill_on_drop(true)
        .spawn()
        .context("starting socat")?;
    let (host_ready, axes_ready) = join!(wait_for_file(&host_path), wait_for_file(&axes_path));
    host_ready?;
    axes_ready?;
    let (reader, writer) = open_port(&axes_path)?;
    let task = tokio::spawn(serve(reader, writer));

    let (halt, halted) = oneshot::channel::<()>();
    let (finished, done) = oneshot::channel();
    tokio::spawn(async move {
        drop(halted.await);
        task.abort();
        drop(task.await);
        if let Err(e) = interrupt(socat).await {
            warn!("failed to stop socat: {:#}", e);
        }
        drop(directory);
        drop(finished.send(()));
    });
    info!("axis bus available at {:?}", host_path);
    Ok(PtyBus {
        path: host_path,
        halt,
        done,
    })
}
