// ===============================
// src/recorder.rs
// ===============================
//
// JSONL recorder for everything published on the aggregator:
// - one event per line, appended
// - BufWriter, flushed every second and every 1000 events
// - parent directory created on demand
// - on a write error the file is reopened once and the line retried
//
// Enabled with `RECORD_FILE=/path/to/events.jsonl`.
//
use std::path::Path;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::aggregator::{EventAggregator, SubscriptionId};
use crate::domain::{Event, EventKind};

const FLUSH_EVERY_N_EVENTS: u32 = 1000;

/// Subscribe to every event kind and hand events to the writer task. Never
/// blocks the publishing thread.
pub fn attach(bus: &EventAggregator, tx: mpsc::UnboundedSender<Event>) -> Vec<SubscriptionId> {
    EventKind::ALL
        .iter()
        .map(|&kind| {
            let tx = tx.clone();
            bus.subscribe(kind, move |ev| {
                // a closed channel means the recorder already stopped
                let _ = tx.send(ev.clone());
            })
        })
        .collect()
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::UnboundedReceiver<Event>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(?e, %path, "recorder: open failed, recording disabled");
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, kind = ev.kind().label(), "recorder: serialize error, skip event");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(?e, "recorder: write failed, attempting reopen");
                    writer = match open_writer(&path).await {
                        Ok(w) => w,
                        Err(e) => {
                            error!(?e, %path, "recorder: reopen failed, recording stopped");
                            return;
                        }
                    };
                    if let Err(e2) = write_line(&mut writer, &line).await {
                        error!(?e2, "recorder: write failed again after reopen, drop event");
                        continue;
                    }
                }

                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}
