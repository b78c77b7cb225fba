//! Station abstraction: one processing stage on its own thread, fed and
//! drained through bounded crossbeam channels.

use crate::pipeline::error::{ErrorReporter, StationError};
use crossbeam_channel::{Receiver, Sender};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub trait Station: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Processes one input, pushing any number of outputs into `out`.
    fn process(
        &mut self,
        input: Self::Input,
        out: &mut Vec<Self::Output>,
    ) -> Result<(), StationError>;

    fn name(&self) -> &'static str;

    /// Called once the input channel closes, before the station stops.
    /// Outputs pushed here are still delivered.
    fn finish(&mut self, _out: &mut Vec<Self::Output>) {}
}

/// Runs a station on a dedicated thread until its input closes, its output
/// is dropped, or it reports a fatal error.
pub struct StationRunner<S: Station> {
    handle: Option<JoinHandle<()>>,
    station_name: &'static str,
    _phantom: PhantomData<S>,
}

impl<S: Station> StationRunner<S> {
    pub fn spawn(
        mut station: S,
        input_rx: Receiver<S::Input>,
        output_tx: Sender<S::Output>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let station_name = station.name();
        let handle = thread::Builder::new()
            .name(format!("station-{}", station_name.to_lowercase()))
            .spawn(move || {
                Self::run_station(&mut station, input_rx, output_tx, error_reporter);
            })
            .map_err(|e| tracing::error!(station = station_name, error = %e, "Failed to spawn station thread"))
            .ok();

        Self {
            handle,
            station_name,
            _phantom: PhantomData,
        }
    }

    fn run_station(
        station: &mut S,
        input_rx: Receiver<S::Input>,
        output_tx: Sender<S::Output>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) {
        let station_name = station.name();
        let mut out = Vec::new();

        while let Ok(input) = input_rx.recv() {
            let result = station.process(input, &mut out);
            if !deliver(&output_tx, &mut out) {
                tracing::debug!(station = station_name, "Output closed, stopping");
                return;
            }
            match result {
                Ok(()) => {}
                Err(error @ StationError::Recoverable(_)) => {
                    error_reporter.report(station_name, &error);
                }
                Err(error @ StationError::Fatal(_)) => {
                    error_reporter.report(station_name, &error);
                    break;
                }
            }
        }

        station.finish(&mut out);
        deliver(&output_tx, &mut out);
        tracing::debug!(station = station_name, "Station stopped");
    }

    /// Waits for the station thread to complete.
    pub fn join(mut self) -> Result<(), String> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| format!("Station '{}' thread panicked", self.station_name)),
            None => Ok(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.station_name
    }
}

/// Sends buffered outputs in order. Returns false once the receiver is gone.
fn deliver<T>(output_tx: &Sender<T>, out: &mut Vec<T>) -> bool {
    for item in out.drain(..) {
        if output_tx.send(item).is_err() {
            return false;
        }
    }
    true
}
