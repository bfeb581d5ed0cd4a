// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// printrelay Net: TCP port probing, protocol-level printer identification,
// bounded subnet scanning, and the IPP / LPR / raw clients used to transmit
// jobs.  Nothing in this crate guesses printer identity from an address; a
// field is either confirmed by the device or left unknown.

pub mod identify;
pub mod ipp_client;
pub mod lpr_client;
pub mod network;
pub mod prober;
pub mod protocol;
pub mod raw_client;
pub mod scanner;
pub mod simulated;

pub use identify::{PrinterIdentifier, ProtocolIdentifier};
pub use prober::{PortProber, TcpProber};
pub use protocol::PrintProtocol;
pub use scanner::{NetworkScanner, ScanReport, ScanRequest, ScanTask};
pub use simulated::SimulatedNetwork;
