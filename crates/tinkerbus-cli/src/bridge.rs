//! JSON-lines bridge between the process' standard streams and the bus.
//!
//! | Direction | Stream | Payload |
//! |---|---|---|
//! | in | stdin | one [`Intent`] per line |
//! | out | stdout | one [`Event`] per line |
//!
//! Lines that do not parse are logged and skipped.

use tinkerbus_middleware::{EventBus, EventSubscriber};
use tinkerbus_types::{Event, Intent};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Publish every intent read from `reader` until EOF. Returns how many
/// intents were published.
pub async fn pump_intents<R>(reader: R, bus: &EventBus) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut published = 0;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Intent>(line) {
            Ok(intent) => {
                debug!(intent = %intent.id, uid = %intent.uid, "intent read");
                bus.publish_intent(intent);
                published += 1;
            }
            Err(err) => warn!(error = %err, "skipping malformed intent line"),
        }
    }
    Ok(published)
}

/// Write every event from `events` to `writer` as one JSON line until
/// cancelled or the bus closes.
pub async fn pump_events<W>(
    mut events: EventSubscriber,
    mut writer: W,
    cancel: CancellationToken,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        write_event(&mut writer, &event).await?;
    }
    writer.flush().await
}

async fn write_event<W>(writer: &mut W, event: &Event) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}
