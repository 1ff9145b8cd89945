//! Call correlation and procedure dispatch on top of the transport layer.
//! See SPEC_FULL.md §4.5–§4.6.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod correlator;
pub mod dispatcher;

pub use correlator::CallCorrelator;
pub use dispatcher::{BoxFuture, Dispatcher, HandlerContext};
