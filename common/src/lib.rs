pub mod config;
pub mod envelope;
pub mod identity;
pub mod lifecycle;
pub mod protocol;
pub mod router;
pub mod topics;
pub mod update;

pub use config::{BuildInfo, CloudConfig, DeviceConfig, TimingConfig};
pub use envelope::{classify, Envelope, EnvelopeError, MessageKind};
pub use identity::{DeviceIdentity, RestoreOutcome, StoreError};
pub use lifecycle::{
    BusCredentials, ChannelError, Command, DeviceRuntime, LifecycleController, Phase, RebootReason,
};
pub use protocol::{CheckinRequest, CheckinStatus};
pub use update::UpdateDecision;
