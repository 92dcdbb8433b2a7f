pub mod bpf;
pub mod config;
pub mod daemon;
pub mod endpoint;
pub mod http;
pub mod kubernetes;
pub mod metrics;
pub mod options;
pub mod program;

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed external input. Never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Kernel map or filesystem resource failure other than a missing entry.
    #[error("resource error: {0}")]
    Resource(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("addr parse error: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("record layout error: {0}")]
    Layout(#[from] regulus_common::LayoutError),

    #[error(transparent)]
    JsonConversion(#[from] serde_json::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("kube watch error: {0}")]
    KubeWatch(#[from] kube::runtime::watcher::Error),

    #[error("{script} failed: {output}")]
    Loader { script: String, output: String },

    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<libbpf_rs::Error> for Error {
    fn from(err: libbpf_rs::Error) -> Self {
        Self::Resource(err.to_string())
    }
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Resource(_) | Error::Layout(_) => "resource",
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::Loader { .. } => "loader",
            Error::Task(_) => "task",
            _ => "other",
        }
    }
}

pub(crate) fn serialize_to_string<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    T: ToString,
{
    value.to_string().serialize(serializer)
}

pub(crate) fn deserialize_from_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let buf = String::deserialize(deserializer)?;
    T::from_str(&buf).map_err(|e| serde::de::Error::custom(e.to_string()))
}
