// src/error.rs
use hyper::StatusCode;

/// Transport-level failure classes derived from the HTTP client's native
/// error kinds. Only the first three drive a backend to UNHEALTHY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Refused,
    TimedOut,
    Aborted,
    Other,
}

impl TransportKind {
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportKind::TimedOut
        } else if err.is_connect() {
            TransportKind::Refused
        } else if err.is_request() || err.is_body() {
            TransportKind::Aborted
        } else {
            TransportKind::Other
        }
    }

    /// Whether this failure class marks the offending backend UNHEALTHY.
    pub fn marks_unhealthy(self) -> bool {
        !matches!(self, TransportKind::Other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Refused => "refused",
            TransportKind::TimedOut => "timed_out",
            TransportKind::Aborted => "aborted",
            TransportKind::Other => "other",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("All API servers are full ({max}/{max})")]
    AllFull { max: usize },

    #[error("All API servers are unavailable")]
    AllUnavailable,

    #[error("No active API servers available")]
    NoActiveServers,

    #[error("upstream request to {backend} failed: {source}")]
    Transport {
        backend: String,
        kind: TransportKind,
        #[source]
        source: reqwest::Error,
    },

    #[error("upstream {backend} answered {status}")]
    Upstream {
        backend: String,
        status: u16,
        body: serde_json::Value,
    },

    #[error("malformed sessions payload from {backend}: {detail}")]
    MalformedUpstream { backend: String, detail: String },

    #[error("Empty response from upstream server")]
    EmptyUpstream,

    #[error("Session {0} not found on any server")]
    SessionNotFound(String),

    #[error("Unknown server id: {0}")]
    UnknownBackend(String),
}

impl GatewayError {
    pub fn transport(backend: &str, source: reqwest::Error) -> Self {
        let kind = TransportKind::from_reqwest(&source);
        GatewayError::Transport {
            backend: backend.to_string(),
            kind,
            source,
        }
    }

    /// HTTP status this error surfaces as at the controller edge.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::AllFull { .. }
            | GatewayError::AllUnavailable
            | GatewayError::NoActiveServers
            | GatewayError::Transport { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::MalformedUpstream { .. } | GatewayError::EmptyUpstream => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::SessionNotFound(_) | GatewayError::UnknownBackend(_) => {
                StatusCode::NOT_FOUND
            }
        }
    }

    /// Stable machine-readable code for capacity conditions.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            GatewayError::AllFull { .. } => Some("ALL_FULL"),
            GatewayError::AllUnavailable => Some("ALL_UNAVAILABLE"),
            GatewayError::NoActiveServers => Some("NO_ACTIVE_SERVERS"),
            _ => None,
        }
    }
}
