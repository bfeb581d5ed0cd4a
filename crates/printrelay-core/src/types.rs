// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the printrelay print server.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PrintRelayError;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique identifier for a print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a printer.
///
/// A printer is identified by its address (one printer per IP), so the id is
/// a thin wrapper that renders as `printer_10_0_0_5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrinterId(pub IpAddr);

impl PrinterId {
    pub fn address(&self) -> IpAddr {
        self.0
    }
}

impl From<IpAddr> for PrinterId {
    fn from(addr: IpAddr) -> Self {
        Self(addr)
    }
}

impl From<Ipv4Addr> for PrinterId {
    fn from(addr: Ipv4Addr) -> Self {
        Self(IpAddr::V4(addr))
    }
}

impl fmt::Display for PrinterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self.0.to_string().replace(['.', ':'], "_");
        write!(f, "printer_{rendered}")
    }
}

impl FromStr for PrinterId {
    type Err = PrintRelayError;

    /// Accepts either the rendered form (`printer_10_0_0_5`) or a bare
    /// address (`10.0.0.5`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<IpAddr>() {
            return Ok(Self(addr));
        }

        let rest = s
            .strip_prefix("printer_")
            .ok_or_else(|| PrintRelayError::InvalidAddress(s.to_string()))?;
        let dotted = rest.replace('_', ".");
        if let Ok(addr) = dotted.parse::<Ipv4Addr>() {
            return Ok(Self(IpAddr::V4(addr)));
        }
        let coloned = rest.replace('_', ":");
        coloned
            .parse::<IpAddr>()
            .map(Self)
            .map_err(|_| PrintRelayError::InvalidAddress(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Printers
// ---------------------------------------------------------------------------

/// Operational status of a printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterStatus {
    Unknown,
    Online,
    Busy,
    Offline,
}

impl fmt::Display for PrinterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Busy => "busy",
            Self::Offline => "offline",
        })
    }
}

/// A printing capability confirmed by a protocol exchange (or implied by an
/// open print port, in the case of `Print`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Print,
    Duplex,
    Color,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Print => "print",
            Self::Duplex => "duplex",
            Self::Color => "color",
        })
    }
}

/// Whether any identifying field was confirmed by a printer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Identity {
    /// Name, model, or manufacturer came back from the device itself.
    Confirmed,
    /// A print port is open but the device did not say what it is.
    Unknown,
}

/// What a single identification exchange learned about a printer.
///
/// Every field is optional: a `None` means "not confirmed", never "guessed".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterInfo {
    pub name: Option<String>,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub location: Option<String>,
    pub capabilities: BTreeSet<Capability>,
    /// Free-text status reported by the device (e.g. an LPD queue listing).
    pub status_text: Option<String>,
}

impl PrinterInfo {
    /// Generic record carrying only the given capabilities.
    pub fn generic(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            capabilities: capabilities.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Whether the device confirmed who it is.
    pub fn has_identity(&self) -> bool {
        self.name.is_some() || self.model.is_some() || self.manufacturer.is_some()
    }

    /// Fill fields that are still unknown from `other`.
    ///
    /// The first non-null value wins: a field that is already set is never
    /// overwritten, and a `None` never erases anything.  Capabilities are a
    /// union.
    pub fn fill_missing(&mut self, other: PrinterInfo) {
        fill(&mut self.name, other.name);
        fill(&mut self.model, other.model);
        fill(&mut self.manufacturer, other.manufacturer);
        fill(&mut self.location, other.location);
        fill(&mut self.status_text, other.status_text);
        self.capabilities.extend(other.capabilities);
    }
}

fn fill(slot: &mut Option<String>, value: Option<String>) {
    if slot.is_none() {
        *slot = value;
    }
}

fn overwrite(slot: &mut Option<String>, value: &Option<String>) {
    if value.is_some() {
        slot.clone_from(value);
    }
}

/// A printer known to the relay, discovered by a scan or added by address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Printer {
    pub id: PrinterId,
    pub address: IpAddr,
    pub open_ports: BTreeSet<u16>,
    pub name: Option<String>,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub location: Option<String>,
    pub capabilities: BTreeSet<Capability>,
    pub status: PrinterStatus,
    /// Jobs submitted to this printer that have not reached a terminal state.
    pub jobs_in_queue: u32,
    pub identity: Identity,
    pub status_text: Option<String>,
    /// Whether the printer was added by address rather than found by a scan.
    pub manually_added: bool,
    /// When a probe last found this printer reachable.
    pub last_seen: DateTime<Utc>,
}

impl Printer {
    /// Build a printer record from a host's open ports and merged
    /// identification results.
    ///
    /// An open print port always implies the `print` capability.
    pub fn from_findings(
        address: IpAddr,
        open_ports: impl IntoIterator<Item = u16>,
        info: PrinterInfo,
    ) -> Self {
        let identity = if info.has_identity() {
            Identity::Confirmed
        } else {
            Identity::Unknown
        };
        let mut capabilities = info.capabilities;
        capabilities.insert(Capability::Print);

        Self {
            id: PrinterId(address),
            address,
            open_ports: open_ports.into_iter().collect(),
            name: info.name,
            model: info.model,
            manufacturer: info.manufacturer,
            location: info.location,
            capabilities,
            status: PrinterStatus::Online,
            jobs_in_queue: 0,
            identity,
            status_text: info.status_text,
            manually_added: false,
            last_seen: Utc::now(),
        }
    }

    /// Name for display: the confirmed name, or a placeholder built from the
    /// address.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Printer at {}", self.address))
    }

    /// Merge newer information over this record.
    ///
    /// Confirmed fields from `newer` replace the current ones; fields
    /// `newer` does not know are kept.  Ports and capabilities are unions.
    /// Queue bookkeeping (`jobs_in_queue`) and a `Busy` status belong to the
    /// dispatcher and survive the merge.
    pub fn merge_from(&mut self, newer: &Printer) {
        overwrite(&mut self.name, &newer.name);
        overwrite(&mut self.model, &newer.model);
        overwrite(&mut self.manufacturer, &newer.manufacturer);
        overwrite(&mut self.location, &newer.location);
        overwrite(&mut self.status_text, &newer.status_text);
        self.open_ports.extend(newer.open_ports.iter().copied());
        self.capabilities.extend(newer.capabilities.iter().copied());

        if self.status != PrinterStatus::Busy && newer.status != PrinterStatus::Unknown {
            self.status = newer.status;
        }
        if newer.identity == Identity::Confirmed {
            self.identity = Identity::Confirmed;
        }
        self.manually_added |= newer.manually_added;
        self.last_seen = self.last_seen.max(newer.last_seen);
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Lifecycle states of a print job.
///
/// Transitions are strictly `Queued -> Printing -> {Completed, Failed}`, with
/// one exception: a queued job cancelled by a server stop goes straight to
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Printing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Printing)
                | (Self::Queued, Self::Failed)
                | (Self::Printing, Self::Completed)
                | (Self::Printing, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Queued => "queued",
            Self::Printing => "printing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

/// Document formats the relay knows how to label for IPP `document-format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    Pdf,
    Jpeg,
    Png,
    PlainText,
    PostScript,
    /// PCL (Printer Command Language).
    Pcl,
    /// Anything else; sent as an opaque byte stream.
    Unknown,
}

impl DocumentType {
    /// MIME type string for IPP `document-format`.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::PlainText => "text/plain",
            Self::PostScript => "application/postscript",
            Self::Pcl => "application/vnd.hp-pcl",
            Self::Unknown => "application/octet-stream",
        }
    }

    /// Infer the document type from a file name's extension.
    pub fn from_file_name(file_name: &str) -> Self {
        let ext = std::path::Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Self::Pdf,
            "jpg" | "jpeg" => Self::Jpeg,
            "png" => Self::Png,
            "txt" => Self::PlainText,
            "ps" | "eps" => Self::PostScript,
            "pcl" => Self::Pcl,
            _ => Self::Unknown,
        }
    }
}

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The server was stopped while the job was queued or printing.
    ServerStopped,
    /// The target printer was removed from the registry before transmission.
    PrinterUnavailable,
    /// The printer protocol reported an error or the connection failed.
    Transmission(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerStopped => f.write_str("server stopped"),
            Self::PrinterUnavailable => f.write_str("printer unavailable"),
            Self::Transmission(detail) => write!(f, "transmission failed: {detail}"),
        }
    }
}

/// A print job submitted to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: JobId,
    pub file_name: String,
    pub target_printer_id: PrinterId,
    pub client_id: String,
    pub document_type: DocumentType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureReason>,
    /// SHA-256 hex digest of the document bytes.
    pub document_hash: String,
    pub total_bytes: u64,
}

impl PrintJob {
    pub fn new(
        file_name: String,
        target_printer_id: PrinterId,
        client_id: String,
        document_hash: String,
        total_bytes: u64,
    ) -> Self {
        let document_type = DocumentType::from_file_name(&file_name);
        Self {
            id: JobId::new(),
            file_name,
            target_printer_id,
            client_id,
            document_type,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            completed_at: None,
            failure: None,
            document_hash,
            total_bytes,
        }
    }
}

/// A job status transition, published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub printer_id: PrinterId,
    pub status: JobStatus,
    pub failure: Option<FailureReason>,
}

// ---------------------------------------------------------------------------
// Server and network state
// ---------------------------------------------------------------------------

/// Lifecycle of the print server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
        })
    }
}

/// An IPv4 /24 subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subnet {
    network: Ipv4Addr,
}

impl Subnet {
    /// The /24 containing `addr`.
    pub fn containing(addr: Ipv4Addr) -> Self {
        let [a, b, c, _] = addr.octets();
        Self {
            network: Ipv4Addr::new(a, b, c, 0),
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        addr.octets()[..3] == self.network.octets()[..3]
    }

    /// Host addresses `.1` through `.254`.
    pub fn hosts(self) -> impl Iterator<Item = Ipv4Addr> {
        let [a, b, c, _] = self.network.octets();
        (1..=254u8).map(move |d| Ipv4Addr::new(a, b, c, d))
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/24", self.network)
    }
}

/// The relay's own position on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub local_address: Ipv4Addr,
    pub subnet: Subnet,
}

impl NetworkInfo {
    pub fn new(local_address: Ipv4Addr) -> Self {
        Self {
            local_address,
            subnet: Subnet::containing(local_address),
        }
    }
}

/// Snapshot of the process-wide server state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    pub status: ServerStatus,
    pub connected_clients: usize,
    pub local_address: Ipv4Addr,
    pub subnet: Subnet,
}
