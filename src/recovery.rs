//! Out-of-memory recovery for a page in progress.
//!
//! Soft recovery asks the band consumer to rasterize some already spooled
//! bands so storage can be re-reserved. Hard recovery terminates the partial
//! page, hands all of it to the consumer and restarts the page from default
//! state. An error raised while recovering is latched and every later call
//! fails with it.

use std::time::Instant;

use bandlist_format::op;

use crate::config::MAX_RECOVERY_ATTEMPTS;
use crate::error::{ClistError, Status};
use crate::spool::SpoolPair;
use crate::types::BandLayout;
use crate::writer::ClistWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryState {
    #[default]
    Normal,
    Recovering,
}

#[derive(Debug, Default)]
pub struct RecoveryController {
    state: RecoveryState,
    latched: Option<ClistError>,
    soft_count: usize,
    hard_count: usize,
}

impl RecoveryController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn is_latched(&self) -> bool {
        self.latched.is_some()
    }

    pub fn soft_count(&self) -> usize {
        self.soft_count
    }

    pub fn hard_count(&self) -> usize {
        self.hard_count
    }

    pub(crate) fn enter(&mut self) -> Result<(), ClistError> {
        if self.state == RecoveryState::Recovering {
            return Err(ClistError::RecoveryReentered);
        }
        self.state = RecoveryState::Recovering;
        Ok(())
    }

    pub(crate) fn leave(&mut self) {
        self.state = RecoveryState::Normal;
    }

    /// Keeps the first error only.
    pub(crate) fn latch(&mut self, err: &ClistError) {
        if self.latched.is_none() {
            log::error!("band list writer latched permanent error: {err}");
            self.latched = Some(err.latched());
        }
    }

    pub(crate) fn check(&self) -> Result<(), ClistError> {
        match &self.latched {
            Some(err) => Err(err.latched()),
            None => Ok(()),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.state = RecoveryState::Normal;
        self.latched = None;
    }
}

/// A terminated prefix of a page handed over by hard recovery.
#[derive(Debug)]
pub struct PartialPage {
    pub page_number: usize,
    pub layout: BandLayout,
    pub spool: SpoolPair,
}

/// The rasterizing side that consumes spooled bands to free memory.
pub trait BandConsumer: Send {
    /// Rasterizes and releases some already flushed bands. Returns how many
    /// remain that could still be drained; zero means nothing more can be
    /// freed this way.
    fn drain_some(&mut self, spool: &mut SpoolPair) -> Result<usize, ClistError>;

    /// Takes ownership of a terminated partial page.
    fn drain_all(&mut self, page: PartialPage) -> Result<(), ClistError>;
}

impl ClistWriter {
    /// Runs `step`, recovering from retryable memory errors and retrying.
    /// The returned status says whether any recovery happened.
    pub(crate) fn with_recovery<T>(
        &mut self,
        mut step: impl FnMut(&mut ClistWriter) -> Result<T, ClistError>,
    ) -> Result<(T, Status), ClistError> {
        let mut status = Status::Ok;
        let mut hard_tried = false;
        for _ in 0..MAX_RECOVERY_ATTEMPTS {
            let err = match step(self) {
                Ok(value) => return Ok((value, status)),
                Err(err) if err.is_recoverable_vm() => err,
                Err(err) => return Err(err),
            };
            if self.soft_recover()? {
                status = Status::RecoveredLowMemory;
                continue;
            }
            if !hard_tried && self.consumer.is_some() && self.page_is_dirty() {
                hard_tried = true;
                self.hard_recover_page()?;
                status = Status::RecoveredLowMemory;
                continue;
            }
            return Err(err);
        }
        Err(ClistError::VmError {
            context: "retrying after recovery",
            retryable: false,
        })
    }

    /// Drains spooled bands until the spool reserves can be re-established.
    /// Returns false when soft recovery is unavailable or freed too little.
    pub(crate) fn soft_recover(&mut self) -> Result<bool, ClistError> {
        if !self.config.partial_rendering || self.consumer.is_none() || self.page.is_none() {
            return Ok(false);
        }
        let (data_reserve, block_reserve) = self.reservations()?;
        self.recovery.enter()?;
        let started = Instant::now();
        let result = match (
            self.consumer.as_mut(),
            self.page.as_mut().and_then(|page| page.spool.as_mut()),
        ) {
            (Some(consumer), Some(spool)) => loop {
                let remaining = match consumer.drain_some(spool) {
                    Ok(remaining) => remaining,
                    Err(err) => break Err(err),
                };
                match spool.set_reservations(data_reserve, block_reserve) {
                    Ok(()) => break Ok(true),
                    Err(err) if err.is_recoverable_vm() && remaining > 0 => continue,
                    Err(err) if err.is_recoverable_vm() => break Ok(false),
                    Err(err) => break Err(err),
                }
            },
            _ => Ok(false),
        };
        self.recovery.leave();
        match result {
            Ok(recovered) => {
                if recovered {
                    self.recovery.soft_count += 1;
                    let page_number = self.page_number();
                    if let Some(page) = self.page.as_mut() {
                        page.metrics.soft_recoveries += 1;
                    }
                    log::warn!("page {page_number}: soft recovery drained spooled bands");
                    if let Some(debug) = self.debug.as_deref() {
                        debug.log_event("clist.soft_recovery", page_number, &[]);
                        debug.increment("clist.recovery.soft", 1);
                    }
                    if let Some(perf) = self.perf.as_deref() {
                        perf.log_since("clist.soft_recovery", Some(page_number), started);
                    }
                }
                Ok(recovered)
            }
            Err(err) => {
                self.recovery.latch(&err);
                Err(err)
            }
        }
    }

    /// Terminates the current partial page, hands it to the consumer and
    /// restarts the page. A page with nothing recorded since the last reset
    /// is left alone.
    pub fn hard_recover(&mut self) -> Result<Status, ClistError> {
        self.recovery.check()?;
        if self.page.is_none() {
            return Err(ClistError::NoPage);
        }
        if !self.page_is_dirty() {
            return Ok(Status::Ok);
        }
        if self.consumer.is_none() {
            return Err(ClistError::InvalidConfiguration(
                "hard recovery needs a band consumer".to_string(),
            ));
        }
        self.hard_recover_page()?;
        Ok(Status::RecoveredLowMemory)
    }

    fn hard_recover_page(&mut self) -> Result<(), ClistError> {
        self.recovery.enter()?;
        let started = Instant::now();
        let result = self.restart_page();
        self.recovery.leave();
        let page_number = self.page_number();
        match result {
            Ok(()) => {
                self.recovery.hard_count += 1;
                log::warn!("page {page_number}: hard recovery restarted the page");
                if let Some(debug) = self.debug.as_deref() {
                    debug.log_event("clist.hard_recovery", page_number, &[]);
                    debug.increment("clist.recovery.hard", 1);
                }
                if let Some(perf) = self.perf.as_deref() {
                    perf.log_since("clist.hard_recovery", Some(page_number), started);
                }
                Ok(())
            }
            Err(err) => {
                self.recovery.latch(&err);
                Err(err)
            }
        }
    }

    fn restart_page(&mut self) -> Result<(), ClistError> {
        self.finish_partial_spool()?;
        let page = self.page.as_mut().ok_or(ClistError::NoPage)?;
        let spool = page.spool.take().ok_or(ClistError::NoPage)?;
        let layout = page.layout;
        let partial = PartialPage {
            page_number: page.number,
            layout,
            spool,
        };
        page.metrics.hard_recoveries += 1;
        page.metrics.data_bytes += partial.spool.data_len();
        page.metrics.block_bytes += partial.spool.block_len();
        if let Some(stats) = page.stats.as_mut() {
            stats.tile_resets += 1;
        }
        self.consumer
            .as_mut()
            .ok_or_else(|| {
                ClistError::InvalidConfiguration("hard recovery needs a band consumer".to_string())
            })?
            .drain_all(partial)?;

        self.arena.reset(layout.nbands);
        self.states.reset(layout.nbands);
        self.tiles.reset(layout.nbands);
        let mut spool = self.backend.open_pair()?;
        let (data_reserve, block_reserve) = self.config.reservations_for(&layout);
        spool.set_reservations(data_reserve, block_reserve)?;
        if let Some(page) = self.page.as_mut() {
            page.spool = Some(spool);
            page.dirty = false;
        }
        self.put_page_header()
    }

    /// Ends every band and writes the terminator, draining bands when the
    /// spool cannot grow.
    fn finish_partial_spool(&mut self) -> Result<(), ClistError> {
        let mut exhausted = false;
        loop {
            let err = match self.flush_lists(op::END_PAGE) {
                Ok(_) => return Ok(()),
                Err(err) if err.is_recoverable_vm() && !exhausted => err,
                Err(err) => return Err(err),
            };
            let remaining = match (
                self.consumer.as_mut(),
                self.page.as_mut().and_then(|page| page.spool.as_mut()),
            ) {
                (Some(consumer), Some(spool)) => consumer.drain_some(spool)?,
                _ => return Err(err),
            };
            // One more attempt after the consumer reports it is empty.
            exhausted = remaining == 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentry_is_refused() {
        let mut controller = RecoveryController::new();
        controller.enter().unwrap();
        assert_eq!(controller.state(), RecoveryState::Recovering);
        assert!(matches!(
            controller.enter(),
            Err(ClistError::RecoveryReentered)
        ));
        controller.leave();
        assert_eq!(controller.state(), RecoveryState::Normal);
        controller.enter().unwrap();
    }

    #[test]
    fn latch_keeps_the_first_error_and_its_class() {
        let mut controller = RecoveryController::new();
        controller.check().unwrap();
        controller.latch(&ClistError::from(std::io::Error::other("disk gone")));
        controller.latch(&ClistError::NoPage);
        let err = controller.check().unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Io);
        assert_eq!(err.code(), crate::error::IO_ERROR);
        assert!(err.to_string().contains("disk gone"));
        controller.clear();
        controller.check().unwrap();
    }
}
