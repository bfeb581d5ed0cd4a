// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for printrelay.
//
// Only contract violations (unknown printer, wrong server state, duplicate
// address) and protocol/transport failures are errors.  A closed port or a
// host that is not a printer is a normal scan outcome and never reaches this
// type.

use std::net::IpAddr;

use thiserror::Error;

use crate::types::PrinterId;

/// Top-level error type for all printrelay operations.
#[derive(Debug, Error)]
pub enum PrintRelayError {
    // -- Registry / dispatcher contract --
    #[error("unknown printer: {0}")]
    UnknownPrinter(PrinterId),

    #[error("printer at {0} is already registered")]
    AlreadyExists(IpAddr),

    #[error("no printer found at {0}")]
    NoPrinterFound(IpAddr),

    #[error("print server is not running")]
    ServerNotRunning,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    // -- Protocol errors --
    #[error("IPP request failed: {0}")]
    IppRequest(String),

    #[error("transmission failed: {0}")]
    Transmission(String),

    /// Identification failures never abort a scan; the identifier logs them
    /// and falls back to generic information.
    #[error("printer identification failed: {0}")]
    Identify(String),

    // -- Configuration / local I/O --
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PrintRelayError>;
