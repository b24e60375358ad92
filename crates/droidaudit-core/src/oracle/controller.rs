//! Capability interfaces of the device controller collaborator.
//!
//! A controller advertises each capability through an `as_*` accessor. Oracles call
//! the `require_*` helpers and turn a [`MissingCapability`] into an inconclusive
//! decision instead of probing for methods.

use thiserror::Error;

use super::Capability;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error("device command failed: {0}")]
    Command(String),
    #[error("device unavailable")]
    Unavailable,
}

pub trait SupportsAdbShell: Send + Sync {
    fn adb_shell(&self, command: &str) -> Result<String, ControllerError>;
}

pub trait SupportsDumpsys: Send + Sync {
    fn dumpsys(&self, service: &str) -> Result<String, ControllerError>;
}

pub trait SupportsPullFile: Send + Sync {
    fn pull_file(&self, device_path: &str) -> Result<Vec<u8>, ControllerError>;
}

pub trait SupportsForeground: Send + Sync {
    fn foreground_package(&self) -> Result<Option<String>, ControllerError>;
}

pub trait DeviceController: Send + Sync {
    fn as_adb_shell(&self) -> Option<&dyn SupportsAdbShell> {
        None
    }

    fn as_dumpsys(&self) -> Option<&dyn SupportsDumpsys> {
        None
    }

    fn as_pull_file(&self) -> Option<&dyn SupportsPullFile> {
        None
    }

    fn as_foreground(&self) -> Option<&dyn SupportsForeground> {
        None
    }

    fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::AdbShell => self.as_adb_shell().is_some(),
            Capability::Dumpsys => self.as_dumpsys().is_some(),
            Capability::PullFile => self.as_pull_file().is_some(),
            Capability::Foreground => self.as_foreground().is_some(),
            // Supplied by the episode anchor, not the controller.
            Capability::TimeAnchor => true,
        }
    }
}

/// A controller with no capabilities, for offline runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Detached;

impl DeviceController for Detached {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("missing capability: {0}")]
pub struct MissingCapability(pub Capability);

pub fn require_adb_shell(
    controller: &dyn DeviceController,
) -> Result<&dyn SupportsAdbShell, MissingCapability> {
    controller
        .as_adb_shell()
        .ok_or(MissingCapability(Capability::AdbShell))
}

pub fn require_dumpsys(
    controller: &dyn DeviceController,
) -> Result<&dyn SupportsDumpsys, MissingCapability> {
    controller
        .as_dumpsys()
        .ok_or(MissingCapability(Capability::Dumpsys))
}

pub fn require_pull_file(
    controller: &dyn DeviceController,
) -> Result<&dyn SupportsPullFile, MissingCapability> {
    controller
        .as_pull_file()
        .ok_or(MissingCapability(Capability::PullFile))
}

pub fn require_foreground(
    controller: &dyn DeviceController,
) -> Result<&dyn SupportsForeground, MissingCapability> {
    controller
        .as_foreground()
        .ok_or(MissingCapability(Capability::Foreground))
}

/// Required capabilities the controller lacks, in declaration order.
pub fn missing_capabilities(
    controller: &dyn DeviceController,
    required: &[Capability],
) -> Vec<Capability> {
    required
        .iter()
        .copied()
        .filter(|c| !controller.has(*c))
        .collect()
}
