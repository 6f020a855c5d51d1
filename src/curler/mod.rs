// SPDX-License-Identifier: AGPL-3.0-or-later

//! The HTTP-backed job adapter: the one piece of business logic specific
//! to this daemon, everything else being generic Gearman plumbing.

pub mod adapter;
