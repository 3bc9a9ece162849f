use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use axum::extract::{FromRequest, FromRequestParts};
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{AppError, AppResult};

/// Document identifier: 12 bytes rendered as 24 lowercase hex characters.
///
/// Layout: 4-byte big-endian unix seconds, 5 random bytes, 3-byte counter. Ids created
/// in the same process therefore sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(String);

static OID_COUNTER: AtomicU32 = AtomicU32::new(0);

impl ObjectId {
    pub fn new() -> Self {
        let secs = Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
        let random = uuid::Uuid::new_v4();
        let count = OID_COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;

        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&random.as_bytes()[..5]);
        bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);

        let mut hex = String::with_capacity(24);
        for b in bytes {
            hex.push_str(&format!("{:02x}", b));
        }
        ObjectId(hex)
    }

    /// Parses a client supplied id. Upper-case hex is accepted and normalised.
    pub fn parse(value: &str) -> AppResult<Self> {
        let trimmed = value.trim();
        if trimmed.len() != 24 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AppError::InvalidObjectId(format!(
                "{} must be a 12-byte input or a 24-character hex string",
                value
            )));
        }
        Ok(ObjectId(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Creation time encoded in the first four bytes.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let secs = u32::from_str_radix(&self.0[..8], 16).ok()?;
        Utc.timestamp_opt(secs as i64, 0).single()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectId::parse(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ObjectId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// User roles. Stored in snake_case on the user document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    CollegeAdmin,
    Counselor,
    Auditor,
    Panelist,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "super_admin",
            Role::CollegeAdmin => "college_admin",
            Role::Counselor => "counselor",
            Role::Auditor => "auditor",
            Role::Panelist => "panelist",
        }
    }

    pub fn can(&self, permission: Permission) -> bool {
        use Permission::*;
        match self {
            Role::SuperAdmin => true,
            Role::CollegeAdmin => !matches!(permission, ManagePlatform),
            Role::Counselor => matches!(
                permission,
                ViewLeads | ManageLeads | ViewApplications | ManageApplications | Communicate | ViewSegments
            ),
            Role::Auditor => matches!(permission, ViewLeads | ViewApplications | VerifyDocuments),
            Role::Panelist => matches!(permission, ViewApplications | ConductInterviews),
        }
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "super_admin" => Ok(Role::SuperAdmin),
            "college_admin" => Ok(Role::CollegeAdmin),
            "counselor" => Ok(Role::Counselor),
            "auditor" => Ok(Role::Auditor),
            "panelist" => Ok(Role::Panelist),
            other => Err(AppError::validation("role", format!("Unknown role '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ManagePlatform,
    ManageUsers,
    ViewLeads,
    ManageLeads,
    ViewApplications,
    ManageApplications,
    VerifyDocuments,
    ManageTemplates,
    ViewSegments,
    ManageSegments,
    Communicate,
    ManageScholarships,
    ManageVouchers,
    ManageInterviews,
    ConductInterviews,
    ViewDashboard,
    ExportData,
}

/// The authenticated caller, resolved by the auth middleware.
#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    pub user_id: Option<ObjectId>,
    pub name: String,
    pub role: Role,
    pub college_id: Option<String>,
}

impl Principal {
    pub fn require(&self, permission: Permission) -> AppResult<()> {
        if self.role.can(permission) {
            Ok(())
        } else {
            Err(AppError::Forbidden("Not enough permissions".to_string()))
        }
    }

    /// College the principal acts for. Platform admins have none.
    pub fn college(&self) -> AppResult<&str> {
        self.college_id
            .as_deref()
            .ok_or_else(|| AppError::BadRequest("College context required".to_string()))
    }

    pub fn is_counselor(&self) -> bool {
        self.role == Role::Counselor
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Paid,
    Unpaid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStage {
    Initiated,
    Submitted,
}

/// Aggregate document verification state of a student.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DvStatus {
    Pending,
    Verified,
    Rejected,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Paid => "paid",
            PaymentStatus::Unpaid => "unpaid",
        }
    }
}

impl ApplicationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStage::Initiated => "initiated",
            ApplicationStage::Submitted => "submitted",
        }
    }
}

impl DvStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DvStatus::Pending => "pending",
            DvStatus::Verified => "verified",
            DvStatus::Rejected => "rejected",
        }
    }
}

/// JSON body extractor whose rejections use the application error envelope.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct JsonBody<T>(pub T);

/// Query string extractor whose rejections use the application error envelope.
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(AppError))]
pub struct QueryParams<T>(pub T);

/// Current time in the canonical stored format.
pub fn now_iso() -> String {
    to_iso(Utc::now())
}

/// RFC 3339, millisecond precision, `Z` suffix. All stored timestamps use this
/// fixed width format so string order equals time order.
pub fn to_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Which end of a calendar day a bare `YYYY-MM-DD` date resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayBound {
    Start,
    End,
}

/// Parses `YYYY-MM-DD` or RFC 3339 into the canonical stored format.
pub fn parse_date(value: &str, field: &str, bound: DayBound) -> AppResult<String> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let time = match bound {
            DayBound::Start => date.and_hms_milli_opt(0, 0, 0, 0),
            DayBound::End => date.and_hms_milli_opt(23, 59, 59, 999),
        };
        if let Some(naive) = time {
            return Ok(to_iso(Utc.from_utc_datetime(&naive)));
        }
    }
    DateTime::parse_from_rfc3339(value)
        .map(|ts| to_iso(ts.with_timezone(&Utc)))
        .map_err(|_| AppError::validation(field, "Date must be YYYY-MM-DD or RFC 3339"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_is_24_hex_and_unique() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert_eq!(a.as_str().len(), 24);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
        assert!(a.timestamp().is_some());
    }

    #[test]
    fn object_id_parse_rejects_garbage() {
        assert!(matches!(ObjectId::parse("123"), Err(AppError::InvalidObjectId(_))));
        assert!(matches!(ObjectId::parse("zzzzzzzzzzzzzzzzzzzzzzzz"), Err(AppError::InvalidObjectId(_))));
        let parsed = ObjectId::parse("64B7F0C2A1B2C3D4E5F60718").unwrap();
        assert_eq!(parsed.as_str(), "64b7f0c2a1b2c3d4e5f60718");
    }

    #[test]
    fn roles_map_to_permissions() {
        assert!(Role::SuperAdmin.can(Permission::ManagePlatform));
        assert!(!Role::CollegeAdmin.can(Permission::ManagePlatform));
        assert!(Role::Counselor.can(Permission::ManageLeads));
        assert!(!Role::Counselor.can(Permission::ManageTemplates));
        assert!(Role::Auditor.can(Permission::VerifyDocuments));
        assert!(!Role::Panelist.can(Permission::ViewLeads));
    }

    #[test]
    fn dates_resolve_to_day_bounds() {
        assert_eq!(parse_date("2024-03-01", "d", DayBound::Start).unwrap(), "2024-03-01T00:00:00.000Z");
        assert_eq!(parse_date("2024-03-01", "d", DayBound::End).unwrap(), "2024-03-01T23:59:59.999Z");
        assert_eq!(
            parse_date("2024-03-01T10:00:00+05:30", "d", DayBound::Start).unwrap(),
            "2024-03-01T04:30:00.000Z"
        );
        assert!(parse_date("01/03/2024", "d", DayBound::Start).is_err());
    }
}
