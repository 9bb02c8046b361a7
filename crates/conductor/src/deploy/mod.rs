/// iSCSI 部署核心

mod cleaning;
mod continuation;
mod error;
pub mod ledger;
mod orchestrator;
mod params;
mod ramdisk;
mod rollback;
mod vendor;
mod writer;

pub use cleaning::{agent_get_clean_steps, InbandCleaning, ERASE_DEVICES_STEP};
pub use continuation::AsyncContinuationHandler;
pub use error::DeployError;
pub use orchestrator::DeploymentOrchestrator;
pub use params::{
    parse_instance_info, DeployParamBuilder, DeployParameters, DeployTarget, ParsedInstanceInfo,
    PartitionParameters,
};
pub use ramdisk::{build_agent_options, resolve_api_url, CONTROL_PLANE_SERVICE_TYPE};
pub use rollback::FailureRollbackPolicy;
pub use vendor::AgentDeployVendor;
pub use writer::{
    DeployResult, DiskWriter, ImageKind, ImageWriters, DISK_IDENTIFIER_KEY,
    EFI_SYSTEM_PARTITION_UUID_KEY, ROOT_UUID_KEY,
};
