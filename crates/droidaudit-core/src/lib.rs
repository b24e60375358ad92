// Copyright (c) 2026 DroidAudit Contributors
// SPDX-License-Identifier: Apache-2.0

//! droidaudit-core
//!
//! Evidence-trust substrate for mobile agent evaluation episodes.
//!
//! This crate implements:
//! - the evidence-pack contract (run + episode layout, degradation, bundle audit)
//! - the device-input trace pipeline (L0 writer, L1/L2 mappers, per-level validator)
//! - the oracle protocol (decisions, hybrid fallback, anti-pollution time window)
//! - detectors that derive digest-stable, PII-safe facts from raw evidence
//! - policy-compiled assertions and the audit engine that persists their verdicts

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod assertions;
pub mod audit;
pub mod bundle;
pub mod canonical;
pub mod detectors;
pub mod device_input;
pub mod error;
pub mod evidence_pack;
pub mod facts;
pub mod jsonl;
pub mod oracle;
pub mod policy;

pub use crate::audit::{AuditEngine, AuditReport};
pub use crate::bundle::{audit_bundle, BundleAuditReport};
pub use crate::error::{AuditError, AuditResult};
pub use crate::facts::{Fact, FactStore};
pub use crate::policy::CaseContext;
