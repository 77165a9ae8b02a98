//! Wire-protocol types shared between the daemon and its clients.
//!
//! The protocol is a 4-byte little-endian length prefix followed by a JSON
//! request or response tree (see the daemon's session module for framing).
//! This crate only knows about the shape of those trees: verb names, the
//! load encoding, and error codes. It has no knowledge of sockets.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Verb names recognized by the dispatcher.
pub mod verbs {
    pub const CREATE_CONTEXT: &str = "createContext";
    pub const ECHO_CONTEXT: &str = "echoContext";
    pub const DESTROY_CONTEXT: &str = "destroyContext";
    pub const IS_DAEMON_RUNNING: &str = "isDaemonRunning";

    pub const LOAD_ONE_DEVICE: &str = "loadOneDevice";
    pub const UNLOAD_ONE_DEVICE: &str = "unloadOneDevice";
    pub const ENABLE_ONE_DEVICE: &str = "enableOneDevice";
    pub const DISABLE_ONE_DEVICE: &str = "disableOneDevice";

    pub const CU_ALLOC: &str = "cuAlloc";
    pub const CU_ALLOC_FROM_DEV: &str = "cuAllocFromDev";
    pub const CU_ALLOC_WITH_LOAD: &str = "cuAllocWithLoad";
    pub const CU_ALLOC_LEAST_USED_WITH_LOAD: &str = "cuAllocLeastUsedWithLoad";
    pub const CU_ALLOC_LEAST_USED_FROM_DEV: &str = "cuAllocLeastUsedFromDev";

    pub const CU_LIST_ALLOC: &str = "cuListAlloc";
    pub const UDF_CU_GROUP_DECLARE: &str = "udfCuGroupDeclare";
    pub const UDF_CU_GROUP_UNDECLARE: &str = "udfCuGroupUndeclare";
    pub const CU_GROUP_ALLOC: &str = "cuGroupAlloc";

    pub const CU_RELEASE: &str = "cuRelease";
    pub const CU_LIST_RELEASE: &str = "cuListRelease";
    pub const CU_GROUP_RELEASE: &str = "cuGroupRelease";

    pub const CU_POOL_RESERVE: &str = "cuPoolReserve";
    pub const CU_POOL_RELINQUISH: &str = "cuPoolRelinquish";

    pub const ALLOCATION_QUERY: &str = "allocationQuery";
    pub const RESERVATION_QUERY: &str = "reservationQuery";

    pub const CHECK_CU_AVAILABLE_NUM: &str = "checkCuAvailableNum";
    pub const CHECK_CU_LIST_AVAILABLE_NUM: &str = "checkCuListAvailableNum";
    pub const CHECK_CU_GROUP_AVAILABLE_NUM: &str = "checkCuGroupAvailableNum";
    pub const CHECK_CU_POOL_AVAILABLE_NUM: &str = "checkCuPoolAvailableNum";

    pub const CU_CHECK_STATUS: &str = "cuCheckStatus";
    pub const CU_GET_MAX_CAPACITY: &str = "cuGetMaxCapacity";
    pub const EXEC_XRM_PLUGIN_FUNC: &str = "execXrmPluginFunc";

    // V2 equivalents: same semantics, plus the policy fields (deviceId as a
    // hard device constraint, virtualDeviceId, memoryBank, preference) that
    // `parse_descriptor` already reads off any request. Allocation, listing,
    // grouping, and pool reservation each have a V2 counterpart; V2 list
    // allocation additionally groups by `virtualDeviceId` when present.
    pub const CU_ALLOC_V2: &str = "cuAllocV2";
    pub const CU_ALLOC_FROM_DEV_V2: &str = "cuAllocFromDevV2";
    pub const CU_LIST_ALLOC_V2: &str = "cuListAllocV2";
    pub const CU_GROUP_ALLOC_V2: &str = "cuGroupAllocV2";
    pub const CU_POOL_RESERVE_V2: &str = "cuPoolReserveV2";
    pub const CU_POOL_RELINQUISH_V2: &str = "cuPoolRelinquishV2";
}

/// Error codes returned on the wire, per the protocol's `status.value` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    Generic = -1,
    InvalidArgument = -2,
    NoDevice = -3,
    NoKernel = -4,
    NoChannel = -5,
    ConnectFail = -21,
    DeviceNotLoaded = -31,
    DeviceBusy = -32,
    DeviceLocked = -33,
}

impl ErrorCode {
    pub fn value(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Errors in parsing or encoding wire-level values (not resource errors).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("field {0} has the wrong type")]
    WrongType(String),
    #[error("requestLoadOriginal and requestLoadUnified disagree, or both/neither sub-field is set")]
    ConflictingLoad,
    #[error("load value {0} is out of range")]
    LoadOutOfRange(u32),
}

/// The maximum unified load value a CU can carry (100%).
pub const MAX_UNIFIED_LOAD: u32 = 1_000_000;

/// A load value as encoded by a client: either a percent (0..100) or a
/// fine-grain unified value (0..1,000,000), packed into one integer.
///
/// Bits 0..7 hold the percent form; bits 8..27 hold the fine-grain form.
/// Exactly one of the two sub-fields is nonzero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLoadOriginal {
    pub percent: u8,
    pub fine: u32,
}

impl RequestLoadOriginal {
    const PERCENT_MASK: u32 = 0xFF;
    const FINE_SHIFT: u32 = 8;
    const FINE_MASK: u32 = 0x000F_FFFF;

    /// Decode the packed wire representation.
    pub fn decode(raw: u32) -> Result<Self, ProtoError> {
        let percent = (raw & Self::PERCENT_MASK) as u8;
        let fine = (raw >> Self::FINE_SHIFT) & Self::FINE_MASK;

        let this = Self { percent, fine };
        this.normalize()?;
        Ok(this)
    }

    /// Encode back into the packed wire representation.
    pub fn encode(self) -> u32 {
        (self.percent as u32) | (self.fine << Self::FINE_SHIFT)
    }

    /// Normalize to the unified 0..1,000,000 form, validating that exactly
    /// one of the percent/fine sub-fields is nonzero and in range.
    pub fn normalize(self) -> Result<u32, ProtoError> {
        match (self.percent, self.fine) {
            (0, 0) => Ok(0),
            (p, 0) if p <= 100 => Ok(p as u32 * 10_000),
            (0, f) if f <= MAX_UNIFIED_LOAD => Ok(f),
            (p, 0) => Err(ProtoError::LoadOutOfRange(p as u32)),
            (0, f) => Err(ProtoError::LoadOutOfRange(f)),
            _ => Err(ProtoError::ConflictingLoad),
        }
    }

    /// Build a `RequestLoadOriginal` that carries a percent value.
    pub fn from_percent(percent: u8) -> Self {
        Self { percent, fine: 0 }
    }

    /// Build a `RequestLoadOriginal` that carries a fine-grain value.
    pub fn from_fine(fine: u32) -> Self {
        Self { percent: 0, fine }
    }
}

/// V2's packed `deviceInfo` field: bits 39..32 hold a constraint type, bits
/// 31..0 hold the device (or virtual-device) index. Packed the same way
/// `RequestLoadOriginal` packs percent/fine, rather than as separate wire
/// fields, matching how the V2 request struct actually lays out policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceConstraint {
    None,
    Hardware(u32),
    Virtual(u32),
}

impl DeviceConstraint {
    pub fn decode(raw: u64) -> Self {
        let constraint_type = (raw >> 32) & 0xFF;
        let index = (raw & 0xFFFF_FFFF) as u32;
        match constraint_type {
            1 => Self::Hardware(index),
            2 => Self::Virtual(index),
            _ => Self::None,
        }
    }

    pub fn encode(self) -> u64 {
        match self {
            Self::None => 0,
            Self::Hardware(index) => (1u64 << 32) | index as u64,
            Self::Virtual(index) => (2u64 << 32) | index as u64,
        }
    }
}

/// V2's packed `memoryInfo` field: same shape as `DeviceConstraint`, one
/// constraint type (0 = none, 1 = hardware memory bank).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryConstraint {
    None,
    Bank(u32),
}

impl MemoryConstraint {
    pub fn decode(raw: u64) -> Self {
        let constraint_type = (raw >> 32) & 0xFF;
        let bank = (raw & 0xFFFF_FFFF) as u32;
        match constraint_type {
            1 => Self::Bank(bank),
            _ => Self::None,
        }
    }

    pub fn encode(self) -> u64 {
        match self {
            Self::None => 0,
            Self::Bank(bank) => (1u64 << 32) | bank as u64,
        }
    }
}

/// V2's packed `policyInfo` field: bits 7..0 hold a policy type (0 = none,
/// 1 = most-used-first, 2 = least-used-first); honored best-effort by the
/// allocator, never weakening the capacity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    None,
    MostUsedFirst,
    LeastUsedFirst,
}

impl Policy {
    pub fn decode(raw: u64) -> Self {
        match raw & 0xFF {
            1 => Self::MostUsedFirst,
            2 => Self::LeastUsedFirst,
            _ => Self::None,
        }
    }

    pub fn encode(self) -> u64 {
        match self {
            Self::None => 0,
            Self::MostUsedFirst => 1,
            Self::LeastUsedFirst => 2,
        }
    }
}

/// A parsed incoming request.
#[derive(Debug, Clone)]
pub struct Request {
    pub name: String,
    pub request_id: i64,
    pub parameters: Value,
}

impl Request {
    /// Parse the outer `{"request": {...}}` envelope and validate that
    /// `name` and `requestId` are present, per the session's contract.
    pub fn from_envelope(envelope: &Value) -> Result<Self, ProtoError> {
        let request = envelope
            .get("request")
            .ok_or_else(|| ProtoError::MissingField("request".to_string()))?;

        let name = request
            .get("name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProtoError::MissingField("request.name".to_string()))?
            .to_string();

        let request_id = request
            .get("requestId")
            .and_then(Value::as_i64)
            .ok_or_else(|| ProtoError::MissingField("request.requestId".to_string()))?;

        let parameters = request
            .get("parameters")
            .cloned()
            .unwrap_or(Value::Object(Default::default()));

        Ok(Self {
            name,
            request_id,
            parameters,
        })
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn string_field(&self, key: &str) -> Option<String> {
        self.field(key)
            .and_then(Value::as_str)
            .map(|s| s.to_string())
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.field(key).and_then(Value::as_u64)
    }

    pub fn i64_field(&self, key: &str) -> Option<i64> {
        self.field(key).and_then(Value::as_i64)
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.field(key).and_then(Value::as_bool)
    }
}

/// Builder for the `{"response": {...}}` envelope.
pub struct ResponseBuilder {
    name: String,
    request_id: i64,
    status: i32,
    data: serde_json::Map<String, Value>,
}

impl ResponseBuilder {
    pub fn new(name: impl Into<String>, request_id: i64) -> Self {
        Self {
            name: name.into(),
            request_id,
            status: ErrorCode::Success.value(),
            data: serde_json::Map::new(),
        }
    }

    pub fn status(mut self, code: ErrorCode) -> Self {
        self.status = code.value();
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn failed(name: impl Into<String>, request_id: i64, diagnostic: impl Into<String>) -> Value {
        Self::new(name, request_id)
            .status(ErrorCode::Generic)
            .field("failed", diagnostic.into())
            .build()
    }

    pub fn build(self) -> Value {
        serde_json::json!({
            "response": {
                "name": self.name,
                "requestId": self.request_id,
                "status": { "value": self.status },
                "data": Value::Object(self.data),
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalize_percent() {
        let l = RequestLoadOriginal::from_percent(30);
        assert_eq!(l.normalize(), Ok(300_000));
    }

    #[test]
    fn normalize_fine() {
        let l = RequestLoadOriginal::from_fine(123_456);
        assert_eq!(l.normalize(), Ok(123_456));
    }

    #[test]
    fn normalize_rejects_both_set() {
        let l = RequestLoadOriginal {
            percent: 10,
            fine: 10,
        };
        assert_eq!(l.normalize(), Err(ProtoError::ConflictingLoad));
    }

    #[test]
    fn normalize_rejects_percent_over_100() {
        let l = RequestLoadOriginal::from_percent(101);
        assert_eq!(l.normalize(), Err(ProtoError::LoadOutOfRange(101)));
    }

    #[test]
    fn encode_decode_round_trip() {
        let l = RequestLoadOriginal::from_fine(500_000);
        let raw = l.encode();
        assert_eq!(RequestLoadOriginal::decode(raw), Ok(l));
    }

    #[test]
    fn request_from_envelope_requires_name_and_id() {
        let v = serde_json::json!({"request": {"parameters": {}}});
        assert!(Request::from_envelope(&v).is_err());

        let v = serde_json::json!({"request": {"name": "cuAlloc", "parameters": {}}});
        assert!(Request::from_envelope(&v).is_err());

        let v = serde_json::json!({"request": {"name": "cuAlloc", "requestId": 1, "parameters": {"a": 1}}});
        let r = Request::from_envelope(&v).unwrap();
        assert_eq!(r.name, "cuAlloc");
        assert_eq!(r.request_id, 1);
        assert_eq!(r.u64_field("a"), Some(1));
    }

    #[test]
    fn device_constraint_round_trips() {
        assert_eq!(DeviceConstraint::decode(DeviceConstraint::None.encode()), DeviceConstraint::None);
        assert_eq!(
            DeviceConstraint::decode(DeviceConstraint::Hardware(3).encode()),
            DeviceConstraint::Hardware(3)
        );
        assert_eq!(
            DeviceConstraint::decode(DeviceConstraint::Virtual(7).encode()),
            DeviceConstraint::Virtual(7)
        );
    }

    #[test]
    fn memory_constraint_round_trips() {
        assert_eq!(MemoryConstraint::decode(MemoryConstraint::None.encode()), MemoryConstraint::None);
        assert_eq!(
            MemoryConstraint::decode(MemoryConstraint::Bank(2).encode()),
            MemoryConstraint::Bank(2)
        );
    }

    #[test]
    fn policy_round_trips() {
        assert_eq!(Policy::decode(Policy::None.encode()), Policy::None);
        assert_eq!(Policy::decode(Policy::MostUsedFirst.encode()), Policy::MostUsedFirst);
        assert_eq!(Policy::decode(Policy::LeastUsedFirst.encode()), Policy::LeastUsedFirst);
    }

    #[test]
    fn response_builder_shapes_envelope() {
        let v = ResponseBuilder::new("cuAlloc", 7)
            .field("cuId", 2)
            .build();
        assert_eq!(v["response"]["name"], "cuAlloc");
        assert_eq!(v["response"]["requestId"], 7);
        assert_eq!(v["response"]["status"]["value"], 0);
        assert_eq!(v["response"]["data"]["cuId"], 2);
    }
}
