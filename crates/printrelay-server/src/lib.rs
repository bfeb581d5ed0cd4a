// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// printrelay Server: the printer registry, the per-printer job dispatcher,
// and the controller that ties discovery and dispatch to a start/stop
// lifecycle.

pub mod controller;
pub mod dispatcher;
pub mod registry;

pub use controller::PrintServer;
pub use dispatcher::{JobDispatcher, JobTransport, ProtocolTransport};
pub use registry::{AddMode, PrinterRegistry};
