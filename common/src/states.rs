//! Provider lifecycle states.
//!
//! The cloud APIs report states as free-form strings. They are converted into
//! these closed variants once, where provider responses are decoded; anything
//! unrecognised is carried verbatim in `Unknown`.
use schemars::{JsonSchema, r#gen::SchemaGenerator, schema::Schema};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a PowerVS asynchronous job
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    Queued,
    /// Any recognised in-progress state, keeping the provider's wording
    Importing(String),
    Completed,
    Failed,
    Unknown(String),
}

impl From<&str> for JobState {
    fn from(raw: &str) -> Self {
        match raw {
            "queued" => JobState::Queued,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            "readyForProcessing" | "inProgress" | "running" | "waiting" => JobState::Importing(raw.to_string()),
            other => JobState::Unknown(other.to_string()),
        }
    }
}

impl JobState {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Queued => "queued",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Importing(raw) | JobState::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a PowerVS boot image, also recorded in the image status
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ImageState {
    Queued,
    Importing,
    Active,
    Failed,
    Unknown(String),
}

impl From<&str> for ImageState {
    fn from(raw: &str) -> Self {
        match raw {
            "queued" => ImageState::Queued,
            "importing" => ImageState::Importing,
            "active" => ImageState::Active,
            "failed" => ImageState::Failed,
            other => ImageState::Unknown(other.to_string()),
        }
    }
}

impl From<String> for ImageState {
    fn from(raw: String) -> Self {
        ImageState::from(raw.as_str())
    }
}

impl From<ImageState> for String {
    fn from(state: ImageState) -> Self {
        state.to_string()
    }
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageState::Queued => f.write_str("queued"),
            ImageState::Importing => f.write_str("importing"),
            ImageState::Active => f.write_str("active"),
            ImageState::Failed => f.write_str("failed"),
            ImageState::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// State of a VPC virtual server instance, also recorded in the machine status
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopped,
    Failed,
    /// starting, stopping, restarting, deleting and anything newer
    Unknown(String),
}

impl From<&str> for InstanceStatus {
    fn from(raw: &str) -> Self {
        match raw {
            "pending" => InstanceStatus::Pending,
            "running" => InstanceStatus::Running,
            "stopped" => InstanceStatus::Stopped,
            "failed" => InstanceStatus::Failed,
            other => InstanceStatus::Unknown(other.to_string()),
        }
    }
}

impl From<String> for InstanceStatus {
    fn from(raw: String) -> Self {
        InstanceStatus::from(raw.as_str())
    }
}

impl From<InstanceStatus> for String {
    fn from(state: InstanceStatus) -> Self {
        state.to_string()
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Pending => f.write_str("pending"),
            InstanceStatus::Running => f.write_str("running"),
            InstanceStatus::Stopped => f.write_str("stopped"),
            InstanceStatus::Failed => f.write_str("failed"),
            InstanceStatus::Unknown(raw) => f.write_str(raw),
        }
    }
}

// Both persist as plain strings.
macro_rules! string_schema {
    ($t:ty) => {
        impl JsonSchema for $t {
            fn is_referenceable() -> bool {
                false
            }

            fn schema_name() -> String {
                stringify!($t).to_string()
            }

            fn json_schema(generator: &mut SchemaGenerator) -> Schema {
                String::json_schema(generator)
            }
        }
    };
}
string_schema!(ImageState);
string_schema!(InstanceStatus);
