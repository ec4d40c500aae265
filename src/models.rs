use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ledger: LedgerConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "LedgerConfig::default_dir")]
    pub dir: PathBuf,

    #[serde(default = "LedgerConfig::default_file_prefix")]
    pub file_prefix: String,

    #[serde(default = "LedgerConfig::default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

impl LedgerConfig {
    fn default_dir() -> PathBuf {
        "promo_codes".into()
    }

    fn default_file_prefix() -> String {
        "quiz_".into()
    }

    fn default_max_upload_bytes() -> u64 {
        4 * 1024 * 1024
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            dir: Self::default_dir(),
            file_prefix: Self::default_file_prefix(),
            max_upload_bytes: Self::default_max_upload_bytes(),
        }
    }
}

/// A single distributable code. `owner` is free-form and may be empty.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PromoCodeRecord {
    pub code: String,
    pub owner: String,
    pub activated: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct ImportReport {
    pub quiz_id: String,
    pub records: usize,
    pub available: usize,
    pub duplicates: usize,
    pub imported_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub total: usize,
    pub available: usize,
    pub activated: usize,
}
