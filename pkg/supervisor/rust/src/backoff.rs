// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::spec::RestartDelays;
use std::time::Duration;

const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Capped exponential delay between an exit and the next launch.
///
/// Delay = base * 2^n, capped at `max`, where n counts consecutive runs
/// shorter than `stable_after`. Never zero.
#[derive(Debug)]
pub struct Backoff {
    delays: RestartDelays,
    attempts: u32,
}

impl Backoff {
    pub fn new(delays: RestartDelays) -> Self {
        Self {
            delays,
            attempts: 0,
        }
    }

    /// Delay before relaunching a worker whose last run lasted `last_run`.
    pub fn next_delay(&mut self, last_run: Duration) -> Duration {
        if last_run >= self.delays.stable_after {
            self.attempts = 0;
        }
        let factor = 2u32.saturating_pow(self.attempts.min(MAX_BACKOFF_EXPONENT));
        self.attempts = self.attempts.saturating_add(1);
        self.delays
            .base
            .saturating_mul(factor)
            .min(self.delays.max)
            .max(Duration::from_millis(1))
    }
}
