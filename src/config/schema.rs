use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{CameraError, Result};
use crate::sensor::format::{PixelFormat, Resolution};

/// Main camera configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Which feature set this camera exposes
    pub profile: CameraProfile,
    /// Back-facing cameras have a focuser; front-facing ones only accept AF OFF
    pub facing_back: bool,
    /// Sensor geometry and scene settings
    pub sensor: SensorConfig,
    /// Request sequencing limits and wait budgets
    pub pipeline: PipelineConfig,
    /// Compressed output settings
    pub jpeg: JpegConfig,
    /// 3A simulation settings
    pub control: ControlConfig,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            profile: CameraProfile::default(),
            facing_back: true,
            sensor: SensorConfig::default(),
            pipeline: PipelineConfig::default(),
            jpeg: JpegConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

impl CameraConfig {
    /// Parse a JSON document and validate it
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CameraConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let res = self.sensor.resolution();
        if res.width < 2 || res.height < 2 || res.width % 2 != 0 || res.height % 2 != 0 {
            return Err(CameraError::Config(format!(
                "sensor resolution {} must be even and at least 2x2",
                res
            )));
        }
        if !(2..=4).contains(&self.pipeline.max_in_flight) {
            return Err(CameraError::Config(format!(
                "max_in_flight must be within 2..=4, got {}",
                self.pipeline.max_in_flight
            )));
        }
        if self.sensor.hour > 23 {
            return Err(CameraError::Config(format!(
                "hour must be within 0..=23, got {}",
                self.sensor.hour
            )));
        }
        if !(1..=100).contains(&self.jpeg.quality) {
            return Err(CameraError::Config(format!(
                "jpeg quality must be within 1..=100, got {}",
                self.jpeg.quality
            )));
        }
        if self.jpeg.max_size == 0 {
            return Err(CameraError::Config("jpeg max_size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.profile.capabilities()
    }
}

/// Feature flags a camera may advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    BackwardCompatible,
    ManualSensor,
    ManualPostProcessing,
    Raw,
    DepthOutput,
}

/// Resolved capability set of one camera
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    caps: BTreeSet<Capability>,
}

impl CapabilitySet {
    pub fn new(caps: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            caps: caps.into_iter().collect(),
        }
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.caps.contains(&cap)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.caps.iter().copied()
    }

    /// Stream formats this camera accepts in a stream configuration
    pub fn allowed_formats(&self) -> Vec<PixelFormat> {
        let mut formats = Vec::new();
        if self.has(Capability::Raw) {
            formats.push(PixelFormat::Raw16);
        }
        if self.has(Capability::BackwardCompatible) {
            formats.extend([
                PixelFormat::Blob,
                PixelFormat::Rgb888,
                PixelFormat::Rgba8888,
                PixelFormat::Nv21,
                PixelFormat::Yv12,
            ]);
        }
        if self.has(Capability::DepthOutput) {
            formats.extend([PixelFormat::Depth16, PixelFormat::DepthPointCloud]);
        }
        formats
    }

    pub fn allows_format(&self, format: PixelFormat) -> bool {
        self.allowed_formats().contains(&format)
    }
}

/// Tagged capability profile, one per camera variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CameraProfile {
    /// Plain color camera
    Basic,
    /// Color camera with manual controls and RAW output
    Full,
    /// Depth-only camera
    Depth,
    /// Explicit list of capabilities
    Custom { capabilities: Vec<Capability> },
}

impl Default for CameraProfile {
    fn default() -> Self {
        Self::Full
    }
}

impl CameraProfile {
    pub fn capabilities(&self) -> CapabilitySet {
        match self {
            CameraProfile::Basic => CapabilitySet::new([Capability::BackwardCompatible]),
            CameraProfile::Full => CapabilitySet::new([
                Capability::BackwardCompatible,
                Capability::ManualSensor,
                Capability::ManualPostProcessing,
                Capability::Raw,
            ]),
            CameraProfile::Depth => CapabilitySet::new([Capability::DepthOutput]),
            CameraProfile::Custom { capabilities } => {
                CapabilitySet::new(capabilities.iter().copied())
            }
        }
    }
}

/// Sensor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub width: u32,
    pub height: u32,
    /// Simulated local hour of day (0-23)
    pub hour: u32,
    /// Seed for read/shot noise; random when unset
    pub noise_seed: Option<u64>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            hour: 12,
            noise_seed: None,
        }
    }
}

impl SensorConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// Request sequencer shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencerShape {
    /// The submitting thread waits for room and configures the sensor itself
    Direct,
    /// A configure thread does the waiting; submission returns after 3A
    Staged,
}

impl Default for SequencerShape {
    fn default() -> Self {
        Self::Direct
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// In-flight queue capacity (2..=4)
    pub max_in_flight: usize,
    pub shape: SequencerShape,
    /// How long to wait on a buffer's acquire fence
    pub fence_timeout_ms: u64,
    /// One vsync wait step
    pub sync_wait_ms: u64,
    /// Vsync wait steps before the request fails
    pub max_sync_retries: u32,
    /// One wait step for a rendered frame in the readout worker
    pub readout_wait_ms: u64,
    /// Readout wait steps before the in-flight request fails
    pub max_readout_retries: u32,
    /// How long admission waits for queue room or a busy compressor
    pub admission_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 2,
            shape: SequencerShape::Direct,
            fence_timeout_ms: 2000,
            sync_wait_ms: 10,
            max_sync_retries: 1000,
            readout_wait_ms: 10,
            max_readout_retries: 1000,
            admission_timeout_ms: 10_000,
        }
    }
}

impl PipelineConfig {
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    pub fn sync_wait(&self) -> Duration {
        Duration::from_millis(self.sync_wait_ms)
    }

    pub fn readout_wait(&self) -> Duration {
        Duration::from_millis(self.readout_wait_ms)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }
}

/// JPEG configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JpegConfig {
    /// Quality used when a request does not carry one (1-100)
    pub quality: u8,
    /// Largest encoded image a BLOB buffer may receive
    pub max_size: usize,
}

impl Default for JpegConfig {
    fn default() -> Self {
        Self {
            quality: 80,
            max_size: 300_000,
        }
    }
}

/// 3A configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Seed for the AE wander and AF outcomes; random when unset
    pub seed: Option<u64>,
    /// Mean number of stable frames before AE starts a new scan
    pub stable_ae_max_frames: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            seed: None,
            stable_ae_max_frames: 100,
        }
    }
}
