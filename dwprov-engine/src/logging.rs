//! Audit logging on a managed data-warehouse cluster.
//!
//! The logging configuration has no existence of its own: it is addressed by
//! the cluster identifier, created by enabling logging, deleted by disabling
//! it, and vanishes together with its cluster.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mapper::StateMapper;
use crate::types::{AttrValue, RemoteState, ResourceId, ResourceSpec};

pub const LOGGING_SLOT: &str = "logging";

pub const ATTR_LOG_DESTINATION_TYPE: &str = "log_destination_type";
pub const ATTR_BUCKET_NAME: &str = "bucket_name";
pub const ATTR_S3_KEY_PREFIX: &str = "s3_key_prefix";
pub const ATTR_LOG_EXPORTS: &str = "log_exports";

pub const COMPUTED_LAST_DELIVERY: &str = "last_successful_delivery_time";
pub const COMPUTED_LAST_FAILURE: &str = "last_failure_time";
pub const COMPUTED_LAST_FAILURE_MESSAGE: &str = "last_failure_message";

/// Where the cluster ships its audit logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogDestinationType {
    #[default]
    S3,
    Cloudwatch,
}

impl LogDestinationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S3 => "s3",
            Self::Cloudwatch => "cloudwatch",
        }
    }
}

impl fmt::Display for LogDestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogDestinationType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "s3" => Ok(Self::S3),
            "cloudwatch" => Ok(Self::Cloudwatch),
            other => Err(format!("unknown log destination type '{}'", other)),
        }
    }
}

/// Log types that can be exported.
pub const LOG_EXPORTS: &[&str] = &["connectionlog", "useractivitylog", "userlog"];

/// Enable-logging call, used for both create and modify.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnableLoggingRequest {
    pub cluster_identifier: String,
    pub log_destination_type: Option<String>,
    pub bucket_name: Option<String>,
    pub s3_key_prefix: Option<String>,
    pub log_exports: Vec<String>,
}

/// Describe-logging-status response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingStatus {
    pub logging_enabled: bool,
    pub log_destination_type: Option<String>,
    pub bucket_name: Option<String>,
    pub s3_key_prefix: Option<String>,
    #[serde(default)]
    pub log_exports: Vec<String>,
    pub last_successful_delivery_time: Option<String>,
    pub last_failure_time: Option<String>,
    pub last_failure_message: Option<String>,
}

/// Mapper between logging specs and the warehouse API shapes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMapper;

fn string_attr<'a>(spec: &'a ResourceSpec, key: &str) -> Result<Option<&'a str>> {
    match spec.get(key) {
        None => Ok(None),
        Some(AttrValue::Str(s)) if s.is_empty() => {
            Err(Error::validation(format!("{} must not be empty", key)))
        }
        Some(AttrValue::Str(s)) => Ok(Some(s)),
        Some(other) => Err(Error::validation(format!(
            "{} must be a string, got {}",
            key,
            other.type_name()
        ))),
    }
}

fn canonical_exports(exports: &[String]) -> Vec<String> {
    let mut out = exports.to_vec();
    out.sort();
    out.dedup();
    out
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

impl StateMapper for LoggingMapper {
    type Request = EnableLoggingRequest;
    type Response = LoggingStatus;

    fn slot(&self) -> &'static str {
        LOGGING_SLOT
    }

    fn normalize(&self, mut spec: ResourceSpec) -> Result<ResourceSpec> {
        if spec.parent_identifier.is_empty() {
            return Err(Error::validation("parent_identifier must not be empty"));
        }
        if spec.parent_identifier.contains(':') {
            return Err(Error::validation(format!(
                "parent_identifier '{}' must not contain ':'",
                spec.parent_identifier
            )));
        }

        if let Some(key) = spec.attributes.keys().find(|k| {
            ![
                ATTR_LOG_DESTINATION_TYPE,
                ATTR_BUCKET_NAME,
                ATTR_S3_KEY_PREFIX,
                ATTR_LOG_EXPORTS,
            ]
            .contains(&k.as_str())
        }) {
            return Err(Error::validation(format!(
                "unsupported attribute '{}' for {}",
                key, LOGGING_SLOT
            )));
        }

        let destination = string_attr(&spec, ATTR_LOG_DESTINATION_TYPE)?
            .map(LogDestinationType::from_str)
            .transpose()
            .map_err(Error::validation)?
            .unwrap_or_default();
        let bucket = string_attr(&spec, ATTR_BUCKET_NAME)?.is_some();
        let prefix = string_attr(&spec, ATTR_S3_KEY_PREFIX)?.is_some();

        match destination {
            LogDestinationType::S3 if !bucket => {
                return Err(Error::validation(
                    "bucket_name is required when log_destination_type is s3",
                ));
            }
            LogDestinationType::Cloudwatch if bucket || prefix => {
                return Err(Error::validation(
                    "bucket_name and s3_key_prefix are only valid with log_destination_type s3",
                ));
            }
            _ => {}
        }

        match spec.attributes.remove(ATTR_LOG_EXPORTS) {
            None => {}
            Some(AttrValue::List(exports)) => {
                if let Some(bad) = exports.iter().find(|e| !LOG_EXPORTS.contains(&e.as_str())) {
                    return Err(Error::validation(format!(
                        "unknown log export '{}', expected one of {}",
                        bad,
                        LOG_EXPORTS.join(", ")
                    )));
                }
                let exports = canonical_exports(&exports);
                if !exports.is_empty() {
                    spec.attributes
                        .insert(ATTR_LOG_EXPORTS.to_string(), AttrValue::List(exports));
                }
            }
            Some(other) => {
                return Err(Error::validation(format!(
                    "log_exports must be a list, got {}",
                    other.type_name()
                )));
            }
        }

        Ok(spec)
    }

    fn to_request(&self, spec: &ResourceSpec) -> Self::Request {
        let text = |key: &str| spec.get(key).and_then(AttrValue::as_str).map(str::to_string);
        EnableLoggingRequest {
            cluster_identifier: spec.parent_identifier.clone(),
            log_destination_type: text(ATTR_LOG_DESTINATION_TYPE),
            bucket_name: text(ATTR_BUCKET_NAME),
            s3_key_prefix: text(ATTR_S3_KEY_PREFIX),
            log_exports: spec
                .get(ATTR_LOG_EXPORTS)
                .and_then(AttrValue::as_list)
                .map(canonical_exports)
                .unwrap_or_default(),
        }
    }

    fn from_response(&self, id: &ResourceId, resp: Self::Response) -> Result<Option<RemoteState>> {
        if !resp.logging_enabled {
            return Ok(None);
        }

        let destination = resp
            .log_destination_type
            .as_deref()
            .ok_or_else(|| Error::malformed(id, "logging enabled without a destination type"))?
            .parse::<LogDestinationType>()
            .map_err(|e| Error::malformed(id, e))?;

        if let Some(bad) = resp
            .log_exports
            .iter()
            .find(|e| !LOG_EXPORTS.contains(&e.as_str()))
        {
            return Err(Error::malformed(id, format!("unknown log export '{}'", bad)));
        }

        let mut attributes = BTreeMap::new();
        attributes.insert(
            ATTR_LOG_DESTINATION_TYPE.to_string(),
            AttrValue::from(destination.as_str()),
        );
        if let Some(bucket) = non_empty(resp.bucket_name) {
            attributes.insert(ATTR_BUCKET_NAME.to_string(), AttrValue::Str(bucket));
        }
        if let Some(prefix) = non_empty(resp.s3_key_prefix) {
            attributes.insert(ATTR_S3_KEY_PREFIX.to_string(), AttrValue::Str(prefix));
        }
        let exports = canonical_exports(&resp.log_exports);
        if !exports.is_empty() {
            attributes.insert(ATTR_LOG_EXPORTS.to_string(), AttrValue::List(exports));
        }

        let mut computed = BTreeMap::new();
        for (key, value) in [
            (COMPUTED_LAST_DELIVERY, resp.last_successful_delivery_time),
            (COMPUTED_LAST_FAILURE, resp.last_failure_time),
            (COMPUTED_LAST_FAILURE_MESSAGE, resp.last_failure_message),
        ] {
            if let Some(v) = value {
                computed.insert(key.to_string(), AttrValue::Str(v));
            }
        }

        Ok(Some(RemoteState {
            id: id.clone(),
            attributes,
            computed,
        }))
    }

    fn defaulted_fields(&self) -> &'static [&'static str] {
        &[ATTR_LOG_DESTINATION_TYPE]
    }
}
