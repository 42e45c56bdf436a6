mod config;
mod error;
mod ledger;
mod paths;

pub use config::{
    DiscoveryConfig, InstallConfig, PatchConfig, PatchInfo, RuntimeConfig, CONFIG_FILE_NAME,
    DEFAULT_STATE_DIR,
};
pub use error::{PatchError, PatchResult};
pub use ledger::{Ledger, LedgerDocument, LedgerEntry, LEDGER_FORMAT_VERSION};
pub use paths::{
    install_root_from_executable, ledger_key, relative_path_string, relative_to_staging_root,
    validated_relative_path,
};
