//! Simulated Sensor Board
//!
//! Emits plausible analog readings (0..1023 ADC counts) for every channel at
//! a fixed cadence so the station can be exercised without hardware.
//! Each channel performs a bounded random walk around its own resting level.
//!
//! # Usage
//! ```toml
//! [serial]
//! transport = "simulated"
//! simulated_interval_ms = 1000
//! ```

use rand::prelude::*;
use std::io;
use std::time::{Duration, Instant};

use super::serial_channel::{LineTransport, SerialSettings, TransportConnector};

/// ADC full scale of the board
const ADC_MAX: f64 = 1023.0;
/// Maximum step of the random walk per sample (counts)
const WALK_STEP: f64 = 4.0;

/// Connector producing [`SimulatedBoard`] transports.
#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    channel_count: usize,
    delimiter: char,
    interval: Duration,
    seed: Option<u64>,
}

impl SimulatedConnector {
    pub fn new(channel_count: usize, delimiter: char, interval: Duration) -> Self {
        Self {
            channel_count,
            delimiter,
            interval,
            seed: None,
        }
    }

    /// Fix the random seed for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl TransportConnector for SimulatedConnector {
    fn connect(&self, settings: &SerialSettings) -> io::Result<Box<dyn LineTransport>> {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let levels = (0..self.channel_count)
            .map(|_| rng.gen_range(80.0..600.0))
            .collect();

        Ok(Box::new(SimulatedBoard {
            rng,
            levels,
            delimiter: self.delimiter,
            interval: self.interval,
            read_timeout: settings.read_timeout,
            next_sample: Instant::now() + self.interval,
        }))
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

/// One simulated board connection.
pub struct SimulatedBoard {
    rng: StdRng,
    levels: Vec<f64>,
    delimiter: char,
    interval: Duration,
    read_timeout: Duration,
    next_sample: Instant,
}

impl SimulatedBoard {
    fn render_sample(&mut self) -> Vec<u8> {
        let mut line = String::with_capacity(self.levels.len() * 8);
        for (i, level) in self.levels.iter_mut().enumerate() {
            *level = (*level + self.rng.gen_range(-WALK_STEP..=WALK_STEP)).clamp(0.0, ADC_MAX);
            if i > 0 {
                line.push(self.delimiter);
            }
            line.push_str(&format!("{:.0}", level));
        }
        line.push_str("\r\n");
        line.into_bytes()
    }
}

impl LineTransport for SimulatedBoard {
    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let now = Instant::now();
        if now < self.next_sample {
            let wait = self.next_sample - now;
            if wait > self.read_timeout {
                std::thread::sleep(self.read_timeout);
                return Ok(None);
            }
            std::thread::sleep(wait);
        }
        self.next_sample += self.interval;
        Ok(Some(self.render_sample()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::FrameParser;
    use crate::types::ChannelSet;

    #[test]
    fn test_simulated_lines_parse() {
        let channels = ChannelSet::new(["MQ2", "MQ3", "MQ135", "MQ136", "MQ137", "MQ138"]);
        let parser = FrameParser::new(channels, ',');
        let connector = SimulatedConnector::new(6, ',', Duration::from_millis(1)).with_seed(7);
        let mut settings = SerialSettings::new("sim", 9600);
        settings.read_timeout = Duration::from_millis(50);

        let mut board = connector.connect(&settings).unwrap();
        for _ in 0..20 {
            let line = board.read_line().unwrap().unwrap();
            let frame = parser.parse_bytes(&line).unwrap();
            assert!(frame.values().iter().all(|v| (0.0..=ADC_MAX).contains(v)));
        }
    }

    #[test]
    fn test_simulated_read_honours_timeout() {
        let connector = SimulatedConnector::new(2, ',', Duration::from_secs(60));
        let mut settings = SerialSettings::new("sim", 9600);
        settings.read_timeout = Duration::from_millis(10);

        let mut board = connector.connect(&settings).unwrap();
        let started = Instant::now();
        assert!(board.read_line().unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
