use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::radiography::RadiographStore;

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub session_ttl_hours: i64,
    pub store: Arc<dyn RadiographStore>,
    pub max_upload_bytes: usize,
    pub clinic_tz_offset_minutes: i32,
}

/* -------------------------
   Envelopes
--------------------------*/

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

impl<T> ApiOk<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

#[derive(Debug, Serialize)]
pub struct OkData {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct PersonBrief {
    pub id: Uuid,
    pub display: String,
    pub number: Option<String>,
}

/* -------------------------
   Auth DTOs
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub device_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponseData {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserProfile,
    pub clinic: ClinicProfile,
}

#[derive(Debug, Serialize)]
pub struct MeResponseData {
    pub user: UserProfile,
    pub clinic: ClinicProfile,
    pub session: SessionInfo,
}

#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: String,
    pub role: Role,
}

#[derive(Debug, Serialize)]
pub struct ClinicProfile {
    pub clinic_name: String,
    pub currency: String,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_token_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/* -------------------------
   DB Row Models
--------------------------*/

#[derive(Debug, sqlx::FromRow)]
pub struct UserRow {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: String,
    pub password_hash: String,
    pub role: i16,
    pub is_active: bool,
}

#[derive(Debug, sqlx::FromRow)]
pub struct SessionTokenRow {
    pub session_token_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/* -------------------------
   Roles
--------------------------*/

/// Staff role, stored as smallint in `staff_user.role`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Dentist,
    Assistant,
    Receptionist,
}

impl Role {
    pub fn code(self) -> i16 {
        match self {
            Role::Admin => 1,
            Role::Dentist => 2,
            Role::Assistant => 3,
            Role::Receptionist => 4,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(Role::Admin),
            2 => Some(Role::Dentist),
            3 => Some(Role::Assistant),
            4 => Some(Role::Receptionist),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Dentist => "dentist",
            Role::Assistant => "assistant",
            Role::Receptionist => "receptionist",
        }
    }

    pub fn allows(self, cap: Capability) -> bool {
        use Capability::*;
        match self {
            Role::Admin => true,
            Role::Dentist => matches!(
                cap,
                PatientsRead
                    | PatientsWrite
                    | AppointmentsManage
                    | ClinicalRead
                    | ClinicalWrite
                    | RadiographUpload
                    | Reports
            ),
            Role::Assistant => matches!(cap, PatientsRead | ClinicalRead | RadiographUpload),
            Role::Receptionist => matches!(
                cap,
                PatientsRead | PatientsWrite | AppointmentsManage | Billing
            ),
        }
    }
}

/// Coarse permission buckets checked by the route handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    StaffAdmin,
    CatalogWrite,
    PatientsRead,
    PatientsWrite,
    AppointmentsManage,
    ClinicalRead,
    ClinicalWrite,
    RadiographUpload,
    Billing,
    Reports,
}

impl Capability {
    pub fn describe(self) -> &'static str {
        match self {
            Capability::StaffAdmin => "manage staff and clinic settings",
            Capability::CatalogWrite => "edit catalogs",
            Capability::PatientsRead => "view patients",
            Capability::PatientsWrite => "edit patients",
            Capability::AppointmentsManage => "manage appointments",
            Capability::ClinicalRead => "view clinical records",
            Capability::ClinicalWrite => "edit clinical records",
            Capability::RadiographUpload => "upload radiographs",
            Capability::Billing => "manage payments",
            Capability::Reports => "view reports",
        }
    }
}

/* -------------------------
   Query helpers
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct Paging {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub const MAX_PAGE_SIZE: i64 = 200;
const DEFAULT_PAGE_SIZE: i64 = 50;

impl Paging {
    /// (limit, offset) clamped to sane bounds.
    pub fn resolve(&self) -> (i64, i64) {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

/// `Option<Option<T>>` for PATCH bodies: absent => None, null => Some(None).
pub fn deserialize_double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let inner = Option::<T>::deserialize(deserializer)?;
    Ok(Some(inner))
}

/// Trimmed, with empty strings collapsed to None.
pub fn clean_opt(s: Option<String>) -> Option<String> {
    s.and_then(|v| {
        let t = v.trim();
        if t.is_empty() { None } else { Some(t.to_string()) }
    })
}

/// Resolve a PATCH field for a nullable text column.
pub fn patch_opt_text(field: Option<Option<String>>, existing: Option<String>) -> Option<String> {
    match field {
        None => existing,
        Some(v) => clean_opt(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_codes_round_trip_through_db_values() {
        for role in [Role::Admin, Role::Dentist, Role::Assistant, Role::Receptionist] {
            assert_eq!(Role::from_code(role.code()), Some(role));
        }
        assert_eq!(Role::from_code(0), None);
        assert_eq!(Role::from_code(5), None);
    }

    #[test]
    fn admin_has_every_capability() {
        for cap in [
            Capability::StaffAdmin,
            Capability::CatalogWrite,
            Capability::Billing,
            Capability::Reports,
            Capability::ClinicalWrite,
        ] {
            assert!(Role::Admin.allows(cap));
        }
    }

    #[test]
    fn receptionist_handles_front_desk_only() {
        assert!(Role::Receptionist.allows(Capability::AppointmentsManage));
        assert!(Role::Receptionist.allows(Capability::Billing));
        assert!(!Role::Receptionist.allows(Capability::ClinicalRead));
        assert!(!Role::Receptionist.allows(Capability::Reports));
    }

    #[test]
    fn assistant_reads_and_uploads_but_does_not_chart() {
        assert!(Role::Assistant.allows(Capability::RadiographUpload));
        assert!(Role::Assistant.allows(Capability::ClinicalRead));
        assert!(!Role::Assistant.allows(Capability::ClinicalWrite));
        assert!(!Role::Assistant.allows(Capability::PatientsWrite));
    }

    #[test]
    fn dentist_cannot_take_payments() {
        assert!(!Role::Dentist.allows(Capability::Billing));
        assert!(Role::Dentist.allows(Capability::ClinicalWrite));
    }

    #[test]
    fn paging_is_clamped() {
        let p = Paging { limit: Some(10_000), offset: Some(-3) };
        assert_eq!(p.resolve(), (MAX_PAGE_SIZE, 0));
        let p = Paging { limit: None, offset: None };
        assert_eq!(p.resolve(), (50, 0));
    }

    #[test]
    fn patch_text_distinguishes_absent_and_null() {
        let existing = Some("old".to_string());
        assert_eq!(patch_opt_text(None, existing.clone()), existing);
        assert_eq!(patch_opt_text(Some(None), existing.clone()), None);
        assert_eq!(patch_opt_text(Some(Some("  ".into())), existing.clone()), None);
        assert_eq!(
            patch_opt_text(Some(Some(" new ".into())), existing),
            Some("new".to_string())
        );
    }

    #[test]
    fn double_option_deserializes_null_as_clear() {
        #[derive(Deserialize)]
        struct Body {
            #[serde(default, deserialize_with = "deserialize_double_option")]
            note: Option<Option<String>>,
        }
        let absent: Body = serde_json::from_str("{}").unwrap();
        assert_eq!(absent.note, None);
        let null: Body = serde_json::from_str(r#"{"note":null}"#).unwrap();
        assert_eq!(null.note, Some(None));
        let set: Body = serde_json::from_str(r#"{"note":"x"}"#).unwrap();
        assert_eq!(set.note, Some(Some("x".into())));
    }
}
