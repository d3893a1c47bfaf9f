// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Error taxonomy shared by every judge component

use thiserror::Error;

/// Errors that can occur while configuring, prompting or parsing a judge call
#[derive(Debug, Error)]
pub enum JudgeError {
    /// Invalid setup (bad endpoint URL, missing model, unreadable config file)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The inference endpoint could not be reached or answered with a failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// The request exceeded its allotted time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Caller input rejected before any network call
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    MetricNotFound(String),

    /// Model output could not be coerced into a verdict
    #[error("Parse error: {message}")]
    Parse {
        message: String,
        raw_response: Option<String>,
    },

    /// Any transport failure surfaced through the orchestrator
    #[error("Failed to get model response: {0}")]
    ModelCall(#[source] Box<JudgeError>),

    #[error("{message}")]
    RetryExhausted {
        message: String,
        #[source]
        last_error: Box<JudgeError>,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, JudgeError>;

impl JudgeError {
    pub fn parse(message: impl Into<String>, raw_response: impl Into<String>) -> Self {
        JudgeError::Parse {
            message: message.into(),
            raw_response: Some(raw_response.into()),
        }
    }

    /// Verbatim model output attached to a parse failure
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            JudgeError::Parse { raw_response, .. } => raw_response.as_deref(),
            JudgeError::ModelCall(inner) => inner.raw_response(),
            _ => None,
        }
    }

    /// True when the failure (possibly wrapped) was a request timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            JudgeError::Timeout(_) => true,
            JudgeError::ModelCall(inner) => inner.is_timeout(),
            JudgeError::RetryExhausted { last_error, .. } => last_error.is_timeout(),
            JudgeError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// True for transport-level failures worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, JudgeError::Connection(_) | JudgeError::Timeout(_))
    }
}
