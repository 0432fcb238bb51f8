use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::UrgentConfig;

/// Counts urgent triggers and holds urgent mode open for a fixed duration.
///
/// `trigger_count` triggers inside `window` activate the mode. Triggers while
/// active extend it.
#[derive(Debug)]
pub struct UrgentInterruptDetector {
    trigger_count: usize,
    window: Duration,
    mode_duration: Duration,
    triggers: VecDeque<Instant>,
    active_until: Option<Instant>,
}

impl UrgentInterruptDetector {
    pub fn new(trigger_count: usize, window: Duration, mode_duration: Duration) -> Self {
        Self {
            trigger_count: trigger_count.max(1),
            window,
            mode_duration,
            triggers: VecDeque::new(),
            active_until: None,
        }
    }

    pub fn from_config(config: &UrgentConfig) -> Self {
        Self::new(
            config.trigger_count,
            config.trigger_window(),
            config.mode_duration(),
        )
    }

    /// Record one trigger. Returns true when this trigger activated the mode.
    pub fn record_trigger(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.triggers.front() {
            if now.duration_since(oldest) > self.window {
                self.triggers.pop_front();
            } else {
                break;
            }
        }
        self.triggers.push_back(now);

        if self.triggers.len() < self.trigger_count {
            return false;
        }
        let was_active = self.is_active(now);
        self.triggers.clear();
        self.active_until = Some(now + self.mode_duration);
        !was_active
    }

    pub fn is_active(&self, now: Instant) -> bool {
        self.active_until.is_some_and(|until| now < until)
    }

    /// Clear an elapsed mode. Returns true when the mode just ended.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.active_until {
            Some(until) if now >= until => {
                self.active_until = None;
                true
            }
            _ => false,
        }
    }

    pub fn pending_triggers(&self) -> usize {
        self.triggers.len()
    }
}
