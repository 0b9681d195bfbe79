//! Imperative camera controls issued by the detector on mode transitions.

use std::process::Command;

use tracing::debug;

use crate::types::CaptureError;

/// Exposure, white-balance and focus controls for the active camera.
pub trait CameraControl: Send {
    /// Enable or disable automatic exposure and white balance together.
    fn set_auto_exposure(&mut self, enabled: bool) -> Result<(), CaptureError>;

    /// Trigger a single autofocus pass.
    fn reset_autofocus(&mut self) -> Result<(), CaptureError>;
}

/// Controls for sources that expose none (RTSP feeds, recorded files).
#[derive(Debug, Default)]
pub struct NoopControl;

impl CameraControl for NoopControl {
    fn set_auto_exposure(&mut self, enabled: bool) -> Result<(), CaptureError> {
        debug!("Source has no exposure control; ignoring auto-exposure={enabled}");
        Ok(())
    }

    fn reset_autofocus(&mut self) -> Result<(), CaptureError> {
        debug!("Source has no focus control; ignoring autofocus reset");
        Ok(())
    }
}

/// V4L2 device controls applied through `v4l2-ctl`.
#[derive(Debug, Clone)]
pub struct V4l2Control {
    device: String,
}

impl V4l2Control {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    fn set_controls(
        &self,
        control: &'static str,
        assignments: &[(&str, i32)],
    ) -> Result<(), CaptureError> {
        let joined = v4l2_assignments(assignments);
        let output = Command::new("v4l2-ctl")
            .arg("-d")
            .arg(&self.device)
            .arg(format!("--set-ctrl={joined}"))
            .output()
            .map_err(|err| CaptureError::Control {
                control,
                reason: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(CaptureError::Control {
                control,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!("{}: {joined}", self.device);
        Ok(())
    }
}

impl CameraControl for V4l2Control {
    fn set_auto_exposure(&mut self, enabled: bool) -> Result<(), CaptureError> {
        // auto_exposure: 3 = aperture priority (auto), 1 = manual.
        let exposure = if enabled { 3 } else { 1 };
        let white_balance = i32::from(enabled);
        self.set_controls(
            "auto_exposure",
            &[
                ("auto_exposure", exposure),
                ("white_balance_automatic", white_balance),
            ],
        )
    }

    fn reset_autofocus(&mut self) -> Result<(), CaptureError> {
        self.set_controls("focus_automatic_continuous", &[("focus_automatic_continuous", 0)])?;
        self.set_controls("focus_automatic_continuous", &[("focus_automatic_continuous", 1)])
    }
}

fn v4l2_assignments(assignments: &[(&str, i32)]) -> String {
    assignments
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
