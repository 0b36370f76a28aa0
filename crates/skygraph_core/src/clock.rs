/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use chrono::{SecondsFormat, TimeZone, Utc};
use std::sync::{Arc, Mutex};

/// Wall-time source. The mock variant is settable and shared, so a test
/// can move time while the engine holds a copy.
#[derive(Clone)]
pub enum Clock {
    System,
    Mock(Arc<Mutex<i64>>),
}

impl Clock {
    pub fn system() -> Self {
        Clock::System
    }

    pub fn mock(start_unix: i64) -> Self {
        Clock::Mock(Arc::new(Mutex::new(start_unix)))
    }

    pub fn now_unix(&self) -> i64 {
        match self {
            Clock::System => Utc::now().timestamp(),
            Clock::Mock(now) => *now.lock().unwrap(),
        }
    }

    pub fn now_unix_millis(&self) -> i64 {
        match self {
            Clock::System => Utc::now().timestamp_millis(),
            Clock::Mock(now) => *now.lock().unwrap() * 1000,
        }
    }

    pub fn now_string(&self) -> String {
        match self {
            Clock::System => Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            Clock::Mock(now) => Utc
                .timestamp_opt(*now.lock().unwrap(), 0)
                .single()
                .unwrap_or_default()
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    /// Move a mock clock; returns the previous instant. No-op on the
    /// system clock.
    pub fn set_now(&self, now_unix: i64) -> i64 {
        match self {
            Clock::System => self.now_unix(),
            Clock::Mock(cell) => {
                let mut guard = cell.lock().unwrap();
                let old = *guard;
                *guard = now_unix;
                old
            }
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::System
    }
}
