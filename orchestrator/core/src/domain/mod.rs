// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Shared vocabulary of the agent mesh: agent records, coordination ids and
//! statuses, the error taxonomy, domain events and configuration.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types; no I/O, no locking

pub mod agent;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
