// SPDX-License-Identifier: AGPL-3.0-or-later

//! Gearman wire protocol and client/worker connection handling.

pub mod codec;
pub mod constants;
pub mod session;
pub mod submitter;
pub mod supervisor;
pub mod worker;
