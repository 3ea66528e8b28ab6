//! Status codes returned by the master

use std::fmt;

/// Outcome code carried in a master response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MasterStatus {
    Success,
    NotReady,
    Moved,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    AllPartitionFrozen,
    NoPartitionAssigned,
    AllPartitionWaiting,
    AllPartitionInUse,
    PartitionOccupied,
    HeartbeatNoNode,
    DuplicatePartition,
    CertificateFailure,
    ServerReceiveOverflow,
    ConsumeGroupForbidden,
    ServerConsumeSpeedLimit,
    ConsumeContentForbidden,
    InternalServerError,
    ServiceUnavailable,
    InternalServerErrorMsgSetNull,
    Unknown(i32),
}

impl MasterStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            200 => Self::Success,
            201 => Self::NotReady,
            301 => Self::Moved,
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            405 => Self::AllPartitionFrozen,
            406 => Self::NoPartitionAssigned,
            407 => Self::AllPartitionWaiting,
            408 => Self::AllPartitionInUse,
            410 => Self::PartitionOccupied,
            411 => Self::HeartbeatNoNode,
            412 => Self::DuplicatePartition,
            415 => Self::CertificateFailure,
            419 => Self::ServerReceiveOverflow,
            450 => Self::ConsumeGroupForbidden,
            452 => Self::ServerConsumeSpeedLimit,
            455 => Self::ConsumeContentForbidden,
            500 => Self::InternalServerError,
            503 => Self::ServiceUnavailable,
            510 => Self::InternalServerErrorMsgSetNull,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Success => 200,
            Self::NotReady => 201,
            Self::Moved => 301,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::AllPartitionFrozen => 405,
            Self::NoPartitionAssigned => 406,
            Self::AllPartitionWaiting => 407,
            Self::AllPartitionInUse => 408,
            Self::PartitionOccupied => 410,
            Self::HeartbeatNoNode => 411,
            Self::DuplicatePartition => 412,
            Self::CertificateFailure => 415,
            Self::ServerReceiveOverflow => 419,
            Self::ConsumeGroupForbidden => 450,
            Self::ServerConsumeSpeedLimit => 452,
            Self::ConsumeContentForbidden => 455,
            Self::InternalServerError => 500,
            Self::ServiceUnavailable => 503,
            Self::InternalServerErrorMsgSetNull => 510,
            Self::Unknown(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// 5xx codes: the master failed, not the request
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.code())
    }
}

impl fmt::Display for MasterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown status {}", code),
            known => write!(f, "{:?} ({})", known, known.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_map_back() {
        for code in [200, 201, 301, 400, 403, 412, 455, 500, 503, 510] {
            assert_eq!(MasterStatus::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_unknown_code() {
        let status = MasterStatus::from_code(999);
        assert_eq!(status, MasterStatus::Unknown(999));
        assert_eq!(status.code(), 999);
        assert!(!status.is_success());
    }

    #[test]
    fn test_classification() {
        assert!(MasterStatus::Success.is_success());
        assert!(MasterStatus::ServiceUnavailable.is_server_error());
        assert!(!MasterStatus::BadRequest.is_server_error());
        assert_eq!(MasterStatus::Forbidden.to_string(), "Forbidden (403)");
    }
}
