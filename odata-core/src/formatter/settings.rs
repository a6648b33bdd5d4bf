use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub const ODATA_VERSION_HEADER: &str = "OData-Version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum ODataVersion {
    #[serde(rename = "4.0")]
    #[strum(serialize = "4.0")]
    V4,
    #[serde(rename = "4.01")]
    #[strum(serialize = "4.01")]
    V401,
}

pub const DEFAULT_ODATA_VERSION: ODataVersion = ODataVersion::V4;

/// Settings shared by everything that writes a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterSettings {
    /// Unset means [`DEFAULT_ODATA_VERSION`].
    pub version: Option<ODataVersion>,
}

impl WriterSettings {
    pub fn new(version: Option<ODataVersion>) -> Self {
        Self { version }
    }

    pub fn version(&self) -> ODataVersion {
        self.version.unwrap_or(DEFAULT_ODATA_VERSION)
    }
}
