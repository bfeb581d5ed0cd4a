// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer registry.
//
// One entry per address, kept in insertion order for stable display.  Writes
// are serialized behind an `RwLock`; readers proceed concurrently and always
// receive owned snapshots.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use indexmap::IndexMap;
use tracing::{debug, info};

use printrelay_core::error::{PrintRelayError, Result};
use printrelay_core::types::{Printer, PrinterId, PrinterStatus};

/// How `add` treats an address that is already registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// Fail with `AlreadyExists`.
    Reject,
    /// Merge the new record over the existing one.
    Merge,
}

/// Thread-safe store of known printers.
#[derive(Debug, Default)]
pub struct PrinterRegistry {
    printers: RwLock<IndexMap<IpAddr, Printer>>,
}

impl PrinterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexMap<IpAddr, Printer>> {
        self.printers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexMap<IpAddr, Printer>> {
        self.printers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a printer, or merge it into an existing entry when `mode` is
    /// `Merge`.  Returns the stored record.
    pub fn add(&self, printer: Printer, mode: AddMode) -> Result<Printer> {
        let mut printers = self.write();
        match printers.get_mut(&printer.address) {
            Some(_) if mode == AddMode::Reject => {
                Err(PrintRelayError::AlreadyExists(printer.address))
            }
            Some(existing) => {
                existing.merge_from(&printer);
                debug!(addr = %printer.address, "printer merged");
                Ok(existing.clone())
            }
            None => {
                info!(addr = %printer.address, name = %printer.display_name(), "printer registered");
                printers.insert(printer.address, printer.clone());
                Ok(printer)
            }
        }
    }

    pub fn get(&self, address: IpAddr) -> Option<Printer> {
        self.read().get(&address).cloned()
    }

    pub fn get_by_id(&self, id: PrinterId) -> Option<Printer> {
        self.get(id.address())
    }

    pub fn contains(&self, address: IpAddr) -> bool {
        self.read().contains_key(&address)
    }

    /// All printers in insertion order.
    pub fn list(&self) -> Vec<Printer> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Remove a printer, keeping the order of the others.
    pub fn remove(&self, address: IpAddr) -> Option<Printer> {
        let removed = self.write().shift_remove(&address);
        if removed.is_some() {
            info!(addr = %address, "printer removed");
        }
        removed
    }

    pub fn set_status(&self, address: IpAddr, status: PrinterStatus) -> Result<()> {
        self.update(address, |printer| printer.status = status)
            .ok_or(PrintRelayError::UnknownPrinter(PrinterId(address)))
    }

    /// Apply `f` to the printer at `address`, if registered.
    pub fn update<R>(&self, address: IpAddr, f: impl FnOnce(&mut Printer) -> R) -> Option<R> {
        self.write().get_mut(&address).map(f)
    }

    /// Mark every printer whose address is not in `seen` as offline.
    /// Returns the addresses that changed.
    pub fn mark_offline_except(&self, seen: &HashSet<IpAddr>) -> Vec<IpAddr> {
        let mut printers = self.write();
        let mut changed = Vec::new();
        for (address, printer) in printers.iter_mut() {
            if !seen.contains(address) && printer.status != PrinterStatus::Offline {
                printer.status = PrinterStatus::Offline;
                changed.push(*address);
            }
        }
        changed
    }

    pub fn clear(&self) {
        let mut printers = self.write();
        if !printers.is_empty() {
            debug!(count = printers.len(), "registry cleared");
        }
        printers.clear();
    }
}
