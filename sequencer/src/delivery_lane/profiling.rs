// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug)]
pub(super) struct DeliveryLaneMetrics {
    enabled: bool,
    log_interval: Duration,
    window_started_at: Instant,
    loops: u64,
    accepted: u64,
    rejected: u64,
    batch_closes: u64,
    idle_sleeps: u64,
    load_phase: Duration,
    execute_phase: Duration,
    close_phase: Duration,
    idle_sleep: Duration,
}

impl DeliveryLaneMetrics {
    pub(super) fn new(enabled: bool, log_interval: Duration) -> Self {
        Self {
            enabled,
            log_interval,
            window_started_at: Instant::now(),
            loops: 0,
            accepted: 0,
            rejected: 0,
            batch_closes: 0,
            idle_sleeps: 0,
            load_phase: Duration::ZERO,
            execute_phase: Duration::ZERO,
            close_phase: Duration::ZERO,
            idle_sleep: Duration::ZERO,
        }
    }

    pub(super) fn phase_started_at(&self) -> Option<Instant> {
        self.enabled.then(Instant::now)
    }

    pub(super) fn on_loop_start(&mut self) {
        if !self.enabled {
            return;
        }
        self.loops = self.loops.saturating_add(1);
    }

    pub(super) fn on_load_end(&mut self, started_at: Option<Instant>) {
        if !self.enabled {
            return;
        }
        self.load_phase = self.load_phase.saturating_add(elapsed_or_zero(started_at));
    }

    pub(super) fn on_execute_end(&mut self, started_at: Option<Instant>, accepted: bool) {
        if !self.enabled {
            return;
        }
        if accepted {
            self.accepted = self.accepted.saturating_add(1);
        } else {
            self.rejected = self.rejected.saturating_add(1);
        }
        self.execute_phase = self
            .execute_phase
            .saturating_add(elapsed_or_zero(started_at));
    }

    pub(super) fn on_close_end(&mut self, started_at: Option<Instant>) {
        if !self.enabled {
            return;
        }
        self.batch_closes = self.batch_closes.saturating_add(1);
        self.close_phase = self.close_phase.saturating_add(elapsed_or_zero(started_at));
    }

    pub(super) fn on_idle_sleep_end(&mut self, started_at: Option<Instant>) {
        if !self.enabled {
            return;
        }
        self.idle_sleeps = self.idle_sleeps.saturating_add(1);
        self.idle_sleep = self.idle_sleep.saturating_add(elapsed_or_zero(started_at));
    }

    pub(super) fn maybe_log_window(&mut self) {
        if !self.enabled {
            return;
        }
        let elapsed = self.window_started_at.elapsed();
        if elapsed < self.log_interval {
            return;
        }
        self.log_window(elapsed, false);
        self.reset_window();
    }

    pub(super) fn log_final(&mut self) {
        if !self.enabled || self.loops == 0 {
            return;
        }
        let elapsed = self.window_started_at.elapsed();
        self.log_window(elapsed, true);
    }

    fn log_window(&self, elapsed: Duration, final_window: bool) {
        let elapsed_secs = elapsed.as_secs_f64();
        let delivered = self.accepted.saturating_add(self.rejected);
        let delivered_tps = if elapsed_secs > 0.0 {
            delivered as f64 / elapsed_secs
        } else {
            0.0
        };
        let busy = self
            .load_phase
            .saturating_add(self.execute_phase)
            .saturating_add(self.close_phase);
        info!(
            final_window,
            window_ms = elapsed.as_millis() as u64,
            loops = self.loops,
            accepted = self.accepted,
            rejected = self.rejected,
            delivered_tps,
            batch_closes = self.batch_closes,
            idle_sleeps = self.idle_sleeps,
            load_phase_ms = self.load_phase.as_millis() as u64,
            execute_phase_ms = self.execute_phase.as_millis() as u64,
            close_phase_ms = self.close_phase.as_millis() as u64,
            execute_share_pct = percentage(self.execute_phase.as_nanos(), busy.as_nanos()),
            idle_sleep_ms = self.idle_sleep.as_millis() as u64,
            "delivery lane metrics"
        );
    }

    fn reset_window(&mut self) {
        self.window_started_at = Instant::now();
        self.loops = 0;
        self.accepted = 0;
        self.rejected = 0;
        self.batch_closes = 0;
        self.idle_sleeps = 0;
        self.load_phase = Duration::ZERO;
        self.execute_phase = Duration::ZERO;
        self.close_phase = Duration::ZERO;
        self.idle_sleep = Duration::ZERO;
    }
}

fn elapsed_or_zero(started_at: Option<Instant>) -> Duration {
    started_at.map_or(Duration::ZERO, |value| value.elapsed())
}

fn percentage(part: u128, total: u128) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64) * 100.0 / (total as f64)
}
