use chrono::{DateTime, Duration, Utc};
use log::{debug, info};

/// Wall-clock timer for a named stage, logged on start and stop.
pub struct Timer {
    name: String,
    tstamp: Option<DateTime<Utc>>,
    duration: Option<Duration>,
}

impl Timer {
    pub fn new(name: &str) -> Self {
        Timer {
            name: name.to_owned(),
            tstamp: None,
            duration: None,
        }
    }

    pub fn new_start(name: &str) -> Self {
        let mut t = Timer::new(name);
        t.start();
        t
    }

    /// Start (or restart) the timer
    pub fn start(&mut self) {
        debug!("{}: starting", self.name);

        self.tstamp = Some(Utc::now());
        self.duration = None;
    }

    /// Stop the timer and return the elapsed milliseconds
    pub fn stop(&mut self) -> i64 {
        match self.tstamp.take() {
            None => debug!("{}: not running!", self.name),
            Some(tstamp) => {
                let d = Utc::now() - tstamp;

                self.duration = Some(d);
                info!("{} duration: {} msec", self.name, d.num_milliseconds());
            }
        }

        self.millis()
    }

    /// Duration of the last completed run in milliseconds
    pub fn millis(&self) -> i64 {
        self.duration.map(|d| d.num_milliseconds()).unwrap_or(0)
    }
}
