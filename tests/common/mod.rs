//! Shared fixtures: a scripted sensor board and fast test configs.

#![allow(dead_code)]

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use enose_station::acquisition::{LineTransport, SerialSettings, TransportConnector};
use enose_station::{SessionHandle, StationConfig};

/// What the transport does once its scripted lines run out.
#[derive(Debug, Clone, Copy)]
pub enum AfterScript {
    /// Time out every read (a quiet board).
    Idle,
    /// Fail the next read (board unplugged).
    Unplug,
    /// Block one read for this long, ignoring the read timeout (wedged driver).
    Hang(Duration),
    /// Keep sending this line every couple of milliseconds.
    Stream(&'static str),
}

/// Connector replaying canned lines. Connect number `k` replays script `k`
/// (the last script repeats once the list runs out).
pub struct ScriptedConnector {
    scripts: Vec<Vec<String>>,
    fail_opens: u32,
    after: AfterScript,
    attempts: Arc<AtomicU32>,
    opened: AtomicU32,
}

impl ScriptedConnector {
    pub fn new(lines: &[&str]) -> Self {
        Self {
            scripts: vec![lines.iter().map(|l| l.to_string()).collect()],
            fail_opens: 0,
            after: AfterScript::Idle,
            attempts: Arc::new(AtomicU32::new(0)),
            opened: AtomicU32::new(0),
        }
    }

    /// Script used by the following connection.
    pub fn then(mut self, lines: &[&str]) -> Self {
        self.scripts.push(lines.iter().map(|l| l.to_string()).collect());
        self
    }

    pub fn failing_opens(mut self, count: u32) -> Self {
        self.fail_opens = count;
        self
    }

    pub fn after_script(mut self, after: AfterScript) -> Self {
        self.after = after;
        self
    }

    /// Counter of physical open attempts.
    pub fn attempts(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.attempts)
    }
}

impl TransportConnector for ScriptedConnector {
    fn connect(&self, settings: &SerialSettings) -> io::Result<Box<dyn LineTransport>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_opens {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
        }
        let n = self.opened.fetch_add(1, Ordering::SeqCst) as usize;
        let script = &self.scripts[n.min(self.scripts.len() - 1)];
        Ok(Box::new(ScriptedBoard {
            lines: script.iter().map(|l| format!("{l}\r\n").into_bytes()).collect(),
            next: 0,
            after: self.after,
            hung: false,
            read_timeout: settings.read_timeout,
        }))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct ScriptedBoard {
    lines: Vec<Vec<u8>>,
    next: usize,
    after: AfterScript,
    hung: bool,
    read_timeout: Duration,
}

impl LineTransport for ScriptedBoard {
    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        if let Some(line) = self.lines.get(self.next) {
            self.next += 1;
            return Ok(Some(line.clone()));
        }
        match self.after {
            AfterScript::Idle => {
                std::thread::sleep(self.read_timeout);
                Ok(None)
            }
            AfterScript::Unplug => Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged")),
            AfterScript::Hang(d) if !self.hung => {
                self.hung = true;
                std::thread::sleep(d);
                Ok(None)
            }
            AfterScript::Hang(_) => {
                std::thread::sleep(self.read_timeout);
                Ok(None)
            }
            AfterScript::Stream(line) => {
                std::thread::sleep(Duration::from_millis(2));
                Ok(Some(format!("{line}\r\n").into_bytes()))
            }
        }
    }
}

/// Config with millisecond-scale timing, writing under `dir`.
pub fn test_config(dir: &Path, channels: &[&str], phase_secs: f64) -> StationConfig {
    let mut config = StationConfig::default();
    config.channels.names = channels.iter().map(|c| c.to_string()).collect();
    config.serial.port = "/dev/ttyTEST".to_string();
    config.serial.retry_backoff_ms = 10;
    config.serial.settle_ms = 0;
    config.serial.read_timeout_ms = 20;
    config.timing.tick_ms = 50;
    config.timing.join_timeout_ms = 500;
    config.storage.data_dir = dir.display().to_string();
    for phase in [
        &mut config.phases.baseline,
        &mut config.phases.trial,
        &mut config.phases.classification,
        &mut config.phases.exhaust,
    ] {
        phase.duration_secs = phase_secs;
    }
    config
}

/// Wait until run `run_id` has aggregated at least `frames` frames.
pub async fn wait_for_frames(session: &SessionHandle, run_id: u64, frames: u64) {
    let mut live = session.watch_live();
    tokio::time::timeout(
        Duration::from_secs(5),
        live.wait_for(|l| l.run_id == run_id && l.frames >= frames),
    )
    .await
    .expect("timed out waiting for frames")
    .expect("controller stopped");
}
