// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0
pub mod chains;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod jobs;
pub mod lookup;
pub mod monitor;
pub mod processor;
pub mod query;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod validation;
pub mod worker;

#[cfg(test)]
pub mod test_utils;
