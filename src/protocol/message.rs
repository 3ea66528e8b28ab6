//! Protocol message definitions
//!
//! Defines the registration messages exchanged with the master and the
//! codec seam used to turn them into frame payloads.

use serde::{Deserialize, Serialize};

use super::{CodecResult, MasterStatus};

/// Broker checksum sentinel meaning "no checksum known yet"
pub const NO_CHECKSUM: i64 = -1;

/// Suffix appended to the host address to form the default client id
pub const CLIENT_ID_SUFFIX: &str = "-lan";

/// Registration request sent from a client to the master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    /// Client identifier, typically `<host>-lan`
    pub client_id: String,
    /// The client's own address
    pub host_name: String,
    /// Last broker checksum seen, or [`NO_CHECKSUM`]
    pub broker_check_sum: i64,
    /// Topics the client is interested in
    pub topic_list: Vec<String>,
}

impl RegistrationRequest {
    /// Build a request with the default client id and no known checksum
    pub fn new(host_name: impl Into<String>) -> Self {
        let host_name = host_name.into();
        Self {
            client_id: default_client_id(&host_name),
            host_name,
            broker_check_sum: NO_CHECKSUM,
            topic_list: Vec::new(),
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topic_list = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_check_sum(mut self, broker_check_sum: i64) -> Self {
        self.broker_check_sum = broker_check_sum;
        self
    }
}

/// Default client id for a host address
pub fn default_client_id(host_name: &str) -> String {
    format!("{}{}", host_name, CLIENT_ID_SUFFIX)
}

/// Master's answer to a registration request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub success: bool,
    /// Numeric status, see [`MasterStatus`]
    pub err_code: i32,
    pub err_msg: String,
    /// Checksum of the broker configuration the master currently holds
    pub broker_check_sum: i64,
}

impl RegistrationResponse {
    pub fn accepted(broker_check_sum: i64) -> Self {
        Self {
            success: true,
            err_code: MasterStatus::Success.code(),
            err_msg: "OK".to_string(),
            broker_check_sum,
        }
    }

    pub fn rejected(status: MasterStatus, err_msg: impl Into<String>) -> Self {
        Self {
            success: false,
            err_code: status.code(),
            err_msg: err_msg.into(),
            broker_check_sum: NO_CHECKSUM,
        }
    }

    pub fn status(&self) -> MasterStatus {
        MasterStatus::from_code(self.err_code)
    }

    /// The master set the success flag and a success code
    pub fn is_accepted(&self) -> bool {
        self.success && self.status().is_success()
    }
}

/// Serializes registration messages into frame payloads and back.
///
/// The frame layer treats payloads as opaque bytes; implement this to
/// speak a different message encoding than the default [`BincodeCodec`].
pub trait MessageCodec: Send + Sync + 'static {
    fn encode_request(&self, request: &RegistrationRequest) -> CodecResult<Vec<u8>>;

    fn decode_request(&self, payload: &[u8]) -> CodecResult<RegistrationRequest>;

    fn encode_response(&self, response: &RegistrationResponse) -> CodecResult<Vec<u8>>;

    fn decode_response(&self, payload: &[u8]) -> CodecResult<RegistrationResponse>;
}

/// Default message codec using bincode
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl MessageCodec for BincodeCodec {
    fn encode_request(&self, request: &RegistrationRequest) -> CodecResult<Vec<u8>> {
        Ok(bincode::serialize(request)?)
    }

    fn decode_request(&self, payload: &[u8]) -> CodecResult<RegistrationRequest> {
        Ok(bincode::deserialize(payload)?)
    }

    fn encode_response(&self, response: &RegistrationResponse) -> CodecResult<Vec<u8>> {
        Ok(bincode::serialize(response)?)
    }

    fn decode_response(&self, payload: &[u8]) -> CodecResult<RegistrationResponse> {
        Ok(bincode::deserialize(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CodecError;

    #[test]
    fn test_request_defaults() {
        let request = RegistrationRequest::new("192.168.1.11");

        assert_eq!(request.client_id, "192.168.1.11-lan");
        assert_eq!(request.host_name, "192.168.1.11");
        assert_eq!(request.broker_check_sum, NO_CHECKSUM);
        assert!(request.topic_list.is_empty());
    }

    #[test]
    fn test_request_builders() {
        let request = RegistrationRequest::new("10.0.0.1")
            .with_client_id("custom")
            .with_topics(["a", "b"])
            .with_check_sum(9);

        assert_eq!(request.client_id, "custom");
        assert_eq!(request.topic_list, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(request.broker_check_sum, 9);
    }

    #[test]
    fn test_response_roundtrip() {
        let response = RegistrationResponse::rejected(MasterStatus::Forbidden, "not allowed");
        let bytes = BincodeCodec.encode_response(&response).unwrap();
        let decoded = BincodeCodec.decode_response(&bytes).unwrap();

        assert_eq!(decoded, response);
        assert_eq!(decoded.status(), MasterStatus::Forbidden);
    }

    #[test]
    fn test_response_acceptance() {
        assert!(RegistrationResponse::accepted(5).is_accepted());
        assert!(!RegistrationResponse::rejected(MasterStatus::Forbidden, "no").is_accepted());

        // a success flag with a failure code is still a failure
        let mixed = RegistrationResponse {
            err_code: MasterStatus::ServiceUnavailable.code(),
            ..RegistrationResponse::accepted(5)
        };
        assert!(!mixed.is_accepted());
    }

    #[test]
    fn test_truncated_payload_is_serialization_error() {
        let bytes = BincodeCodec
            .encode_request(&RegistrationRequest::new("10.0.0.1"))
            .unwrap();

        match BincodeCodec.decode_request(&bytes[..bytes.len() / 2]) {
            Err(CodecError::Serialization(_)) => {}
            other => panic!("expected serialization error, got {:?}", other),
        }
    }
}
