/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod channel;
pub mod config;
pub mod connection;
pub mod dc_events;
pub mod fetch;
pub mod flight;
pub mod health;
pub mod http_api;
pub mod ice;
pub mod manifest;
pub mod net_metrics;
pub mod queue;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod segment_index;
pub mod signaling;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
