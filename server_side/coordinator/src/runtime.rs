//! The event loop around an [`Engine`]: bus lines in, operator lines in, a
//! periodic tick, and whatever the engine produced written back to the bus.
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use tokio::{
    io::{split, AsyncRead, AsyncWrite, AsyncWriteExt},
    select,
    sync::mpsc,
    time::{interval, sleep, sleep_until, Instant, MissedTickBehavior},
};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, StopBits};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

use crate::engine::{Engine, Intake};

const MAX_LINE_LENGTH: usize = 1024;

/// Opens the axis bus and pulses DTR so attached controllers start from reset.
pub async fn open_serial(
    path: &str,
    baud: u32,
) -> anyhow::Result<(impl AsyncRead + Unpin, impl AsyncWrite + Unpin)> {
    let mut port = tokio_serial::new(path, baud)
        .data_bits(DataBits::Eight)
        .flow_control(FlowControl::None)
        .timeout(Duration::from_millis(30))
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .open_native_async()
        .with_context(|| format!("opening serial port {}", path))?;
    port.write_data_terminal_ready(false).context("dropping DTR")?;
    sleep(Duration::from_millis(2)).await;
    port.write_data_terminal_ready(true).context("raising DTR")?;
    Ok(split(port))
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn write_outgoing<W: AsyncWrite + Unpin>(engine: &mut Engine, writer: &mut W) -> anyhow::Result<()> {
    let outgoing = engine.take_outgoing();
    if outgoing.is_empty() {
        return Ok(());
    }
    for mut line in outgoing {
        line.push('\n');
        writer.write_all(line.as_bytes()).await.context("writing to the axis bus")?;
    }
    writer.flush().await.context("flushing the axis bus")
}

/// Runs until the bus closes, or until `intake` is closed and the engine has
/// nothing left to do. Hands the engine back for inspection.
pub async fn run_coordinator<R, W>(
    mut engine: Engine,
    reader: R,
    mut writer: W,
    mut intake: mpsc::Receiver<String>,
    tick: Duration,
) -> anyhow::Result<Engine>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut intake_open = true;
    loop {
        let flush_at = engine.next_deadline().map(Instant::from_std);
        select! {
            biased;
            line = lines.next() => match line {
                Some(Ok(line)) => engine.on_bus_line(&line, now()),
                Some(Err(e)) => return Err(e).context("reading the axis bus"),
                None => {
                    info!("axis bus closed");
                    break;
                }
            },
            submission = intake.recv(), if intake_open => match submission {
                Some(text) => match engine.submit_command(&text, now()) {
                    Intake::Refused(reason) => warn!("refused {:?}: {}", text, reason),
                    result => debug!("{:?}: {:?}", text, result),
                },
                None => {
                    debug!("intake closed");
                    intake_open = false;
                }
            },
            _ = sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => engine.tick(now()),
            _ = ticker.tick() => engine.tick(now()),
        }
        write_outgoing(&mut engine, &mut writer).await?;
        if !intake_open && engine.is_settled() {
            break;
        }
    }
    write_outgoing(&mut engine, &mut writer).await?;
    Ok(engine)
}
