//! Accelerator memory accounting and eviction.

pub mod eviction;
pub mod vram_ledger;
pub mod vram_monitor;

pub use eviction::{select_idle, select_victims, EvictionCandidate, EvictionScope};
pub use vram_ledger::{LedgerError, ReservationToken, VramBudget, VramLedger};
pub use vram_monitor::{DeviceProbe, MonitorConfig, ProbeError, SweepReport, VramMonitor};
