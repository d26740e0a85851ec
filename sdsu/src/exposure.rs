/*!
Exposure state machine.

A [`Controller`] owns the command engine and the current [`ExposureState`].
Two sequences are supported:

- `Idle -> Clearing -> Idle` for [`Controller::clear_array`]
- `Idle -> Exposing -> Reading -> Idle` for [`Controller::expose`]

Every public operation clears the abort flag on entry and leaves the
controller `Idle` with a cleared abort flag on exit, whatever the outcome.

Cancellation is cooperative. Another thread raises the flag through an
[`AbortHandle`]; the control thread sees it at its next poll point (reply
poll, exposure tick, readout chunk) and sends the abort command that fits
the phase it is in.
*/

use crate::bus::RegisterBus;
use crate::deinterlace::{deinterlace, DeinterlaceOutcome, DeinterlaceType, ImageBuffer};
use crate::engine::{AbortHandle, CommandEngine, EngineTiming};
use crate::error::{Result, SdsuError};
use crate::protocol::{
    BYTES_PER_PIXEL, DEFAULT_EXPOSURE_TICK_MS, DEFAULT_READOUT_REMAINING_TIME_MS,
};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Phase of the controller's single logical exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureState {
    Idle,
    Clearing,
    Exposing,
    Reading,
}

/// Exposure timing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureTiming {
    /// Stop polling elapsed time and start readout once this much remains
    pub readout_lead: Duration,
    /// Interval between elapsed-time queries
    pub tick: Duration,
    /// Bytes requested from the bus per image transfer call
    pub transfer_chunk: usize,
}

impl Default for ExposureTiming {
    fn default() -> Self {
        Self {
            readout_lead: Duration::from_millis(DEFAULT_READOUT_REMAINING_TIME_MS),
            tick: Duration::from_millis(DEFAULT_EXPOSURE_TICK_MS),
            transfer_chunk: 64 * 1024,
        }
    }
}

/// Parameters of one exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureRequest {
    pub ncols: usize,
    pub nrows: usize,
    pub exposure_ms: u32,
    pub deinterlace: DeinterlaceType,
    /// False for dark frames
    pub open_shutter: bool,
}

impl ExposureRequest {
    /// Size of the raw readout in bytes
    pub fn byte_count(&self) -> Result<usize> {
        self.ncols
            .checked_mul(self.nrows)
            .and_then(|n| n.checked_mul(BYTES_PER_PIXEL))
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                SdsuError::invalid_argument(
                    "expose",
                    format!("no valid byte count for {}x{}", self.ncols, self.nrows),
                )
            })
    }

    pub fn validate(&self) -> Result<()> {
        if self.ncols == 0 || self.nrows == 0 {
            return Err(SdsuError::invalid_argument(
                "expose",
                format!("image size {}x{} is empty", self.ncols, self.nrows),
            ));
        }
        if self.exposure_ms == 0 || i32::try_from(self.exposure_ms).is_err() {
            return Err(SdsuError::invalid_argument(
                "expose",
                format!("exposure time {} ms out of range", self.exposure_ms),
            ));
        }
        self.byte_count()?;
        self.deinterlace.validate_dimensions(self.ncols, self.nrows)
    }
}

/// Completed exposure
#[derive(Debug)]
pub struct ExposureResult {
    pub request: ExposureRequest,
    /// Check [`DeinterlaceOutcome::is_transformed`] before assuming row-major data
    pub image: DeinterlaceOutcome,
    /// Last elapsed time reported by the controller before readout
    pub elapsed_ms: u64,
}

/// One SDSU controller with its exposure state
pub struct Controller<B: RegisterBus> {
    engine: CommandEngine<B>,
    state: ExposureState,
    timing: ExposureTiming,
}

impl<B: RegisterBus> Controller<B> {
    pub fn new(bus: B) -> Self {
        Self::from_engine(CommandEngine::new(bus))
    }

    pub fn from_engine(engine: CommandEngine<B>) -> Self {
        Self {
            engine,
            state: ExposureState::Idle,
            timing: ExposureTiming::default(),
        }
    }

    pub fn with_timing(mut self, engine: EngineTiming, exposure: ExposureTiming) -> Self {
        self.engine = self.engine.with_timing(engine);
        self.timing = exposure;
        self
    }

    pub fn state(&self) -> ExposureState {
        self.state
    }

    /// Handle other threads use to request an abort
    pub fn abort_handle(&self) -> AbortHandle {
        self.engine.abort_handle()
    }

    /// Direct access to controller commands. Commands sent this way do
    /// not clear a raised abort flag first.
    pub fn engine(&mut self) -> &mut CommandEngine<B> {
        &mut self.engine
    }

    pub fn into_engine(self) -> CommandEngine<B> {
        self.engine
    }

    /// Run `op` in `state`, and leave the controller Idle with a cleared
    /// abort flag afterwards. An abort seen by `op` is turned into the abort
    /// command that matches the state the controller was in at that moment.
    pub(crate) fn run_in_state<T>(
        &mut self,
        state: ExposureState,
        op: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let abort = self.engine.abort_handle();
        abort.clear();
        self.state = state;
        debug!(?state, "state transition");

        let result = op(self);
        if let Err(err) = &result {
            if err.is_aborted() {
                info!(state = ?self.state, "abort requested");
                if let Err(e) = self.abort_current() {
                    warn!("abort command failed: {}", e);
                }
            }
        }

        self.state = ExposureState::Idle;
        abort.clear();
        debug!("state transition to Idle");
        result
    }

    /// Send the abort command for the current phase and raise the abort flag.
    ///
    /// Exposing gets abort-exposure; Reading gets abort-readout, sent without
    /// waiting for a reply. Clearing has no abort command, only the flag is
    /// raised.
    pub fn abort_current(&mut self) -> Result<()> {
        let abort = self.engine.abort_handle();
        let result = match self.state {
            ExposureState::Exposing => {
                // the flag would end the reply wait immediately
                abort.clear();
                self.engine.abort_exposure()
            }
            ExposureState::Reading => self.engine.abort_readout(),
            ExposureState::Clearing | ExposureState::Idle => Ok(()),
        };
        abort.abort();
        result
    }

    /// Clear charge from the array
    pub fn clear_array(&mut self) -> Result<()> {
        self.run_in_state(ExposureState::Clearing, |c| {
            c.engine.clear_array()?;
            info!("array cleared");
            Ok(())
        })
    }

    /// Take an exposure and read it out
    pub fn expose(&mut self, request: &ExposureRequest) -> Result<ExposureResult> {
        request.validate()?;
        self.run_in_state(ExposureState::Exposing, |c| c.run_exposure(request))
    }

    fn run_exposure(&mut self, request: &ExposureRequest) -> Result<ExposureResult> {
        info!(
            ncols = request.ncols,
            nrows = request.nrows,
            exposure_ms = request.exposure_ms,
            deinterlace = ?request.deinterlace,
            "starting exposure"
        );
        // validate() has checked the range
        self.engine.set_exposure_time(request.exposure_ms as i32)?;
        self.engine.start_exposure(request.open_shutter)?;

        let elapsed_ms = self.wait_for_exposure(u64::from(request.exposure_ms))?;

        self.state = ExposureState::Reading;
        debug!(state = ?self.state, "state transition");
        self.engine.start_readout()?;
        let raw = self.transfer_image(request)?;
        let image = deinterlace(request.deinterlace, raw)?;
        if !image.is_transformed() {
            warn!("image saved in interlaced order");
        }
        info!("exposure complete");

        Ok(ExposureResult {
            request: *request,
            image,
            elapsed_ms,
        })
    }

    /// Poll elapsed time until the remaining time is within the readout lead.
    ///
    /// A failed elapsed-time query is not fatal: the estimate is advanced by
    /// one tick and polling continues. This can start readout early or late
    /// by up to a tick per failed query.
    fn wait_for_exposure(&mut self, exposure_ms: u64) -> Result<u64> {
        let abort = self.engine.abort_handle();
        let lead_ms = self.timing.readout_lead.as_millis() as u64;
        let tick_ms = self.timing.tick.as_millis() as u64;
        let mut elapsed_ms = 0u64;

        while exposure_ms.saturating_sub(elapsed_ms) > lead_ms {
            if abort.is_aborted() {
                return Err(SdsuError::Aborted { operation: "expose" });
            }
            thread::sleep(self.timing.tick);
            if abort.is_aborted() {
                return Err(SdsuError::Aborted { operation: "expose" });
            }
            match self.engine.get_exposure_time() {
                Ok(ms) => elapsed_ms = u64::try_from(ms).unwrap_or(0),
                Err(e) if e.is_aborted() => return Err(e),
                Err(e) => {
                    elapsed_ms += tick_ms;
                    warn!("elapsed time query failed, estimating {} ms: {}", elapsed_ms, e);
                }
            }
            debug!(
                elapsed_ms,
                remaining_ms = exposure_ms.saturating_sub(elapsed_ms),
                "exposure progress"
            );
        }
        Ok(elapsed_ms)
    }

    fn transfer_image(&mut self, request: &ExposureRequest) -> Result<ImageBuffer> {
        let byte_count = request.byte_count()?;
        let mut raw = Vec::new();
        raw.try_reserve_exact(byte_count).map_err(|_| {
            SdsuError::resource(format!("could not allocate {} byte image buffer", byte_count))
        })?;
        raw.resize(byte_count, 0);

        let abort = self.engine.abort_handle();
        let engine_timing = self.engine.timing();
        let chunk = self.timing.transfer_chunk.max(1);
        let mut filled = 0;
        let mut last_progress = Instant::now();
        let start = Instant::now();

        while filled < byte_count {
            if abort.is_aborted() {
                return Err(SdsuError::Aborted { operation: "readout" });
            }
            let end = (filled + chunk).min(byte_count);
            let n = self.engine.bus_mut().read_image(&mut raw[filled..end])?;
            if n == 0 {
                let stalled = last_progress.elapsed();
                if stalled >= engine_timing.reply_timeout {
                    return Err(SdsuError::Timeout {
                        operation: "readout",
                        elapsed_ms: stalled.as_millis() as u64,
                    });
                }
                thread::sleep(engine_timing.poll_interval);
                continue;
            }
            filled += n;
            last_progress = Instant::now();
        }

        let secs = start.elapsed().as_secs_f64();
        info!(
            bytes = byte_count,
            "readout complete in {:.2}s ({:.1} MB/s)",
            secs,
            byte_count as f64 / 1_000_000.0 / secs.max(1e-6)
        );
        ImageBuffer::from_le_bytes(request.ncols, request.nrows, &raw)
    }
}
