pub mod config;
pub mod error;
pub mod paths;
pub mod types;

pub use config::{AssistantConfig, CdpConfig, Config, ContextPreset, DaemonConfig, HealthConfig, SelectorConfig};
pub use error::{Error, Result};
pub use paths::Paths;
pub use types::{
    make_snippet, ChatExport, ChatInfo, ErrorCode, ErrorRecord, Evidence, InteractionRequest,
    ResponseMetadata, SendOutcome, Severity, StageLog, Warning, WarningCode,
};
