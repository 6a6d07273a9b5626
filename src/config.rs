// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Manager configuration and the `CONMGR_*` parameter string parser.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::polling::PollMode;

/// Default worker thread count.
pub const THREAD_COUNT_DEFAULT: usize = 10;
/// Minimum worker thread count.
pub const THREAD_COUNT_MIN: usize = 2;
/// Maximum worker thread count.
pub const THREAD_COUNT_MAX: usize = 1024;
/// Default cap on tracked connections.
pub const MAX_CONNECTIONS_DEFAULT: usize = 150;
/// Default maximum RPC message size in bytes.
pub const MAX_MSG_SIZE_DEFAULT: u32 = 128 * 1024;

const PARAM_POLL_ONLY: &str = "CONMGR_USE_POLL";
const PARAM_THREADS: &str = "CONMGR_THREADS=";
const PARAM_MAX_CONN: &str = "CONMGR_MAX_CONNECTIONS=";
const PARAM_WAIT_WRITE_DELAY: &str = "CONMGR_WAIT_WRITE_DELAY=";
const PARAM_READ_TIMEOUT: &str = "CONMGR_READ_TIMEOUT=";
const PARAM_WRITE_TIMEOUT: &str = "CONMGR_WRITE_TIMEOUT=";
const PARAM_CONNECT_TIMEOUT: &str = "CONMGR_CONNECT_TIMEOUT=";

/// Configuration applied at manager construction.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Worker pool size, clamped to [2, 1024].
    pub threads: usize,
    /// Cap on tracked connections; accept() is paused beyond this.
    pub max_connections: usize,
    /// Readiness backend selection.
    pub poll_mode: PollMode,
    /// Polling interval while waiting for write-complete work to become
    /// runnable when the kernel still holds buffered output.
    pub wait_write_delay: Duration,
    /// Idle threshold before `on_read_timeout` fires.
    pub read_timeout: Duration,
    /// Idle threshold before `on_write_timeout` fires.
    pub write_timeout: Duration,
    /// Idle threshold before `on_connect_timeout` fires.
    pub connect_timeout: Duration,
    /// Longest a quiesce request will wait quietly before logging.
    pub quiesce_timeout: Duration,
    /// Maximum RPC payload size accepted or produced.
    pub max_msg_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            threads: THREAD_COUNT_DEFAULT,
            max_connections: MAX_CONNECTIONS_DEFAULT,
            poll_mode: PollMode::Epoll,
            wait_write_delay: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            quiesce_timeout: Duration::from_secs(10),
            max_msg_size: MAX_MSG_SIZE_DEFAULT,
        }
    }
}

/// Case-insensitive `prefix` strip, returning the remainder on match.
fn strip_param<'a>(token: &'a str, prefix: &str) -> Option<&'a str> {
    if token.len() >= prefix.len() && token[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&token[prefix.len()..])
    } else {
        None
    }
}

fn parse_count(token: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| Error::InvalidParameter(token.to_string()))
}

impl Settings {
    /// Apply a comma-separated `key=value` parameter list on top of the
    /// current values.
    ///
    /// Empty tokens are skipped and unknown keys are logged and ignored.
    /// Parsing the same string twice yields the same configuration.
    pub fn apply_params(&mut self, params: &str) -> Result<()> {
        for token in params.split(',') {
            if token.is_empty() {
                continue;
            }

            if let Some(value) = strip_param(token, PARAM_THREADS) {
                let count = parse_count(token, value)? as usize;
                if !(THREAD_COUNT_MIN..=THREAD_COUNT_MAX).contains(&count) {
                    return Err(Error::InvalidParameter(token.to_string()));
                }
                self.threads = count;
            } else if let Some(value) = strip_param(token, PARAM_MAX_CONN) {
                let count = parse_count(token, value)? as usize;
                if count < 1 {
                    return Err(Error::InvalidParameter(token.to_string()));
                }
                self.max_connections = count;
            } else if token.eq_ignore_ascii_case(PARAM_POLL_ONLY) {
                self.poll_mode = PollMode::Poll;
            } else if let Some(value) = strip_param(token, PARAM_WAIT_WRITE_DELAY) {
                self.wait_write_delay = Duration::from_secs(parse_count(token, value)?);
            } else if let Some(value) = strip_param(token, PARAM_READ_TIMEOUT) {
                self.read_timeout = Duration::from_secs(parse_count(token, value)?);
            } else if let Some(value) = strip_param(token, PARAM_WRITE_TIMEOUT) {
                self.write_timeout = Duration::from_secs(parse_count(token, value)?);
            } else if let Some(value) = strip_param(token, PARAM_CONNECT_TIMEOUT) {
                self.connect_timeout = Duration::from_secs(parse_count(token, value)?);
            } else {
                log::warn!("ignoring unknown parameter {token}");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn params_accumulate_across_calls() {
        let mut settings = Settings::default();
        settings
            .apply_params("CONMGR_THREADS=93,CONMGR_MAX_CONNECTIONS=3484")
            .unwrap();
        settings.apply_params(",,CONMGR_READ_TIMEOUT=9858,,,,,").unwrap();

        assert_eq!(93, settings.threads);
        assert_eq!(3484, settings.max_connections);
        assert_eq!(Duration::from_secs(9858), settings.read_timeout);
    }

    #[test]
    fn params_are_idempotent() {
        let mut once = Settings::default();
        once.apply_params("CONMGR_THREADS=12,CONMGR_USE_POLL").unwrap();

        let mut twice = Settings::default();
        twice.apply_params("CONMGR_THREADS=12,CONMGR_USE_POLL").unwrap();
        twice.apply_params("CONMGR_THREADS=12,CONMGR_USE_POLL").unwrap();

        assert_eq!(once.threads, twice.threads);
        assert_eq!(once.poll_mode, twice.poll_mode);
    }

    #[test]
    fn params_match_case_insensitively() {
        let mut settings = Settings::default();
        settings.apply_params("conmgr_threads=16,conmgr_use_poll").unwrap();
        assert_eq!(16, settings.threads);
        assert_eq!(PollMode::Poll, settings.poll_mode);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut settings = Settings::default();
        settings.apply_params("CONMGR_FLUX_CAPACITOR=88").unwrap();
        assert_eq!(THREAD_COUNT_DEFAULT, settings.threads);
    }

    #[test]
    fn out_of_range_thread_count_is_rejected() {
        let mut settings = Settings::default();
        assert!(settings.apply_params("CONMGR_THREADS=1").is_err());
        assert!(settings.apply_params("CONMGR_THREADS=1025").is_err());
        assert!(settings.apply_params("CONMGR_THREADS=lots").is_err());
    }

    #[test]
    fn zero_max_connections_is_rejected() {
        let mut settings = Settings::default();
        assert!(settings.apply_params("CONMGR_MAX_CONNECTIONS=0").is_err());
    }
}
