pub mod archive;
pub mod content_store;
pub mod deploy_ops;
pub mod password;
pub mod reclaimer;
pub mod serve;

pub use archive::{guess_content_type, is_gzip, read_archive, ArchiveMember};
pub use content_store::{ContentStore, UploadOutcome};
pub use deploy_ops::{ActivatedDeploy, DeployPipeline, PipelineSettings, StartedDeploy};
pub use password::{cookie_name, find_cookie, validate_password, PasswordSealer};
pub use reclaimer::{LogNotifier, Notifier, ReclaimReport, Reclaimer, ReclaimerSettings};
pub use serve::{resolve_asset_path, ServeOutcome, ServeRequest, ServedAsset};
