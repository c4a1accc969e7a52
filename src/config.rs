// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use serde::{Deserialize, Serialize};

/// Tunables for a node's agreement mailbox. Missing fields take their
/// defaults, so hosts can embed this in whatever config format they load.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgreementConfig {
    /// Idle ticks while collecting before heartbeats go out to reachable
    /// peers. Zero turns heartbeats off.
    pub heartbeat_interval: u64,
    /// Largest frame the codec will accept.
    pub max_frame_len: usize,
    /// How many reports for a later round may be held back at once.
    pub defer_limit: usize,
}

impl Default for AgreementConfig {
    fn default() -> Self {
        AgreementConfig {
            heartbeat_interval: 5,
            max_frame_len: 1 << 20,
            defer_limit: 1024,
        }
    }
}
