//! Dental chart model: FDI teeth × faces × diagnoses.
//!
//! Entries are stored flat in `odontogram_entry`; this module validates new
//! entries and folds the active ones into a per-tooth chart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OdontogramError {
    #[error("{0} is not a valid FDI tooth number")]
    InvalidTooth(i16),
    #[error("unknown face code {0}")]
    InvalidFace(i16),
    #[error("unknown dentition {0:?}; expected permanent, deciduous or mixed")]
    InvalidDentition(String),
    #[error("diagnosis {0} applies to a face; a face is required")]
    FaceRequired(String),
    #[error("diagnosis {0} applies to the whole tooth; face must be omitted")]
    FaceNotAllowed(String),
}

impl From<OdontogramError> for ApiError {
    fn from(e: OdontogramError) -> Self {
        let code = match e {
            OdontogramError::InvalidTooth(_) => "INVALID_TOOTH",
            OdontogramError::InvalidFace(_) => "INVALID_FACE",
            _ => "VALIDATION_ERROR",
        };
        ApiError::BadRequest(code, e.to_string())
    }
}

/// A tooth in FDI two-digit notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tooth(i16);

impl Tooth {
    pub fn new(number: i16) -> Result<Self, OdontogramError> {
        let quadrant = number / 10;
        let position = number % 10;
        let max_position = match quadrant {
            1..=4 => 8,
            5..=8 => 5,
            _ => return Err(OdontogramError::InvalidTooth(number)),
        };
        if !(1..=max_position).contains(&position) {
            return Err(OdontogramError::InvalidTooth(number));
        }
        Ok(Tooth(number))
    }

    fn from_parts(quadrant: i16, position: i16) -> Self {
        Tooth(quadrant * 10 + position)
    }

    pub fn number(self) -> i16 {
        self.0
    }

    pub fn quadrant(self) -> i16 {
        self.0 / 10
    }

    pub fn position(self) -> i16 {
        self.0 % 10
    }

    pub fn is_deciduous(self) -> bool {
        self.quadrant() >= 5
    }

    pub fn is_upper(self) -> bool {
        matches!(self.quadrant(), 1 | 2 | 5 | 6)
    }

    /// Incisors and canines.
    pub fn is_anterior(self) -> bool {
        self.position() <= 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dentition {
    Permanent,
    Deciduous,
    Mixed,
}

impl Dentition {
    pub fn parse(raw: Option<&str>) -> Result<Self, OdontogramError> {
        match raw.map(str::trim).unwrap_or("permanent") {
            "" | "permanent" => Ok(Dentition::Permanent),
            "deciduous" => Ok(Dentition::Deciduous),
            "mixed" => Ok(Dentition::Mixed),
            other => Err(OdontogramError::InvalidDentition(other.to_string())),
        }
    }

    pub fn contains(self, tooth: Tooth) -> bool {
        match self {
            Dentition::Permanent => !tooth.is_deciduous(),
            Dentition::Deciduous => tooth.is_deciduous(),
            Dentition::Mixed => true,
        }
    }

    /// Teeth in display order: upper arch right-to-left as seen by the
    /// dentist, then the lower arch. Mixed charts put the deciduous rows
    /// between the permanent ones.
    pub fn teeth(self) -> Vec<Tooth> {
        let permanent_upper = arch_row(1, 2, 8);
        let permanent_lower = arch_row(4, 3, 8);
        let deciduous_upper = arch_row(5, 6, 5);
        let deciduous_lower = arch_row(8, 7, 5);
        match self {
            Dentition::Permanent => [permanent_upper, permanent_lower].concat(),
            Dentition::Deciduous => [deciduous_upper, deciduous_lower].concat(),
            Dentition::Mixed => {
                [permanent_upper, deciduous_upper, deciduous_lower, permanent_lower].concat()
            }
        }
    }
}

fn arch_row(right_quadrant: i16, left_quadrant: i16, teeth_per_quadrant: i16) -> Vec<Tooth> {
    let right = (1..=teeth_per_quadrant)
        .rev()
        .map(|p| Tooth::from_parts(right_quadrant, p));
    let left = (1..=teeth_per_quadrant).map(|p| Tooth::from_parts(left_quadrant, p));
    right.chain(left).collect()
}

/// Tooth surface. Stored as smallint in `odontogram_entry.face`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Face {
    Vestibular,
    Lingual,
    Mesial,
    Distal,
    Occlusal,
}

impl Face {
    pub const ALL: [Face; 5] = [
        Face::Vestibular,
        Face::Lingual,
        Face::Mesial,
        Face::Distal,
        Face::Occlusal,
    ];

    pub fn code(self) -> i16 {
        match self {
            Face::Vestibular => 0,
            Face::Lingual => 1,
            Face::Mesial => 2,
            Face::Distal => 3,
            Face::Occlusal => 4,
        }
    }

    pub fn from_code(code: i16) -> Result<Self, OdontogramError> {
        Face::ALL
            .into_iter()
            .find(|f| f.code() == code)
            .ok_or(OdontogramError::InvalidFace(code))
    }

    /// Clinical name of this surface on a given tooth.
    pub fn label_for(self, tooth: Tooth) -> &'static str {
        match self {
            Face::Vestibular => "vestibular",
            Face::Lingual if tooth.is_upper() => "palatal",
            Face::Lingual => "lingual",
            Face::Mesial => "mesial",
            Face::Distal => "distal",
            Face::Occlusal if tooth.is_anterior() => "incisal",
            Face::Occlusal => "occlusal",
        }
    }
}

/// Whether a diagnosis marks a surface or the whole tooth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosisScope {
    Face,
    Tooth,
}

impl DiagnosisScope {
    pub fn code(self) -> i16 {
        match self {
            DiagnosisScope::Face => 0,
            DiagnosisScope::Tooth => 1,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(DiagnosisScope::Face),
            1 => Some(DiagnosisScope::Tooth),
            _ => None,
        }
    }
}

/// Check a new entry against its diagnosis scope.
pub fn validate_entry(
    diagnosis_code: &str,
    scope: DiagnosisScope,
    face: Option<Face>,
) -> Result<(), OdontogramError> {
    match (scope, face) {
        (DiagnosisScope::Face, None) => Err(OdontogramError::FaceRequired(diagnosis_code.into())),
        (DiagnosisScope::Tooth, Some(_)) => {
            Err(OdontogramError::FaceNotAllowed(diagnosis_code.into()))
        }
        _ => Ok(()),
    }
}

/// An active entry joined with its diagnosis, as loaded for chart rendering.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChartEntry {
    pub entry_id: Uuid,
    pub tooth: i16,
    pub face: Option<i16>,
    pub diagnosis_id: Uuid,
    pub diagnosis_code: String,
    pub diagnosis_name: String,
    pub color: String,
    pub consultation_id: Option<Uuid>,
    pub note: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ChartMark {
    pub entry_id: Uuid,
    pub diagnosis_id: Uuid,
    pub code: String,
    pub name: String,
    pub color: String,
    pub consultation_id: Option<Uuid>,
    pub note: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl From<ChartEntry> for ChartMark {
    fn from(e: ChartEntry) -> Self {
        ChartMark {
            entry_id: e.entry_id,
            diagnosis_id: e.diagnosis_id,
            code: e.diagnosis_code,
            name: e.diagnosis_name,
            color: e.color,
            consultation_id: e.consultation_id,
            note: e.note,
            recorded_at: e.recorded_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FaceChart {
    pub face: Face,
    pub label: &'static str,
    pub marks: Vec<ChartMark>,
}

#[derive(Debug, Serialize)]
pub struct ToothChart {
    pub tooth: i16,
    pub quadrant: i16,
    pub position: i16,
    pub deciduous: bool,
    pub whole_tooth: Vec<ChartMark>,
    pub faces: Vec<FaceChart>,
}

impl ToothChart {
    fn empty(tooth: Tooth) -> Self {
        ToothChart {
            tooth: tooth.number(),
            quadrant: tooth.quadrant(),
            position: tooth.position(),
            deciduous: tooth.is_deciduous(),
            whole_tooth: Vec::new(),
            faces: Face::ALL
                .into_iter()
                .map(|face| FaceChart {
                    face,
                    label: face.label_for(tooth),
                    marks: Vec::new(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Chart {
    pub dentition: Dentition,
    pub teeth: Vec<ToothChart>,
    /// Active entries not shown because they fall outside this dentition.
    pub hidden_entries: usize,
}

/// Fold active entries into the full chart for `dentition`.
///
/// Marks keep the order they arrive in; callers load them by `recorded_at`.
pub fn build_chart(dentition: Dentition, entries: Vec<ChartEntry>) -> Chart {
    let order = dentition.teeth();
    let mut teeth: Vec<ToothChart> = order.iter().copied().map(ToothChart::empty).collect();
    let mut hidden_entries = 0;

    for entry in entries {
        let Ok(tooth) = Tooth::new(entry.tooth) else {
            tracing::warn!(entry_id = %entry.entry_id, tooth = entry.tooth, "skipping entry with invalid tooth");
            hidden_entries += 1;
            continue;
        };
        if !dentition.contains(tooth) {
            hidden_entries += 1;
            continue;
        }
        let Some(idx) = order.iter().position(|t| *t == tooth) else {
            hidden_entries += 1;
            continue;
        };
        let slot = &mut teeth[idx];
        match entry.face.map(Face::from_code) {
            None => slot.whole_tooth.push(entry.into()),
            Some(Ok(face)) => {
                if let Some(fc) = slot.faces.iter_mut().find(|fc| fc.face == face) {
                    fc.marks.push(entry.into());
                }
            }
            Some(Err(_)) => {
                tracing::warn!(entry_id = %entry.entry_id, "skipping entry with invalid face");
                hidden_entries += 1;
            }
        }
    }

    Chart {
        dentition,
        teeth,
        hidden_entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tooth: i16, face: Option<i16>, code: &str) -> ChartEntry {
        ChartEntry {
            entry_id: Uuid::new_v4(),
            tooth,
            face,
            diagnosis_id: Uuid::new_v4(),
            diagnosis_code: code.to_string(),
            diagnosis_name: code.to_string(),
            color: "#000000".into(),
            consultation_id: None,
            note: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn fdi_numbers_are_validated_per_dentition() {
        assert!(Tooth::new(11).is_ok());
        assert!(Tooth::new(48).is_ok());
        assert!(Tooth::new(55).is_ok());
        assert!(Tooth::new(85).is_ok());
        assert_eq!(Tooth::new(19), Err(OdontogramError::InvalidTooth(19)));
        assert_eq!(Tooth::new(56), Err(OdontogramError::InvalidTooth(56)));
        assert_eq!(Tooth::new(10), Err(OdontogramError::InvalidTooth(10)));
        assert_eq!(Tooth::new(91), Err(OdontogramError::InvalidTooth(91)));
        assert_eq!(Tooth::new(-11), Err(OdontogramError::InvalidTooth(-11)));
    }

    #[test]
    fn dentitions_have_expected_sizes() {
        assert_eq!(Dentition::Permanent.teeth().len(), 32);
        assert_eq!(Dentition::Deciduous.teeth().len(), 20);
        assert_eq!(Dentition::Mixed.teeth().len(), 52);
    }

    #[test]
    fn permanent_chart_runs_from_upper_right_molar() {
        let numbers: Vec<i16> = Dentition::Permanent.teeth().iter().map(|t| t.number()).collect();
        assert_eq!(&numbers[..3], &[18, 17, 16]);
        assert_eq!(&numbers[7..9], &[11, 21]);
        assert_eq!(numbers[15], 28);
        assert_eq!(numbers[16], 48);
        assert_eq!(&numbers[23..25], &[41, 31]);
        assert_eq!(numbers[31], 38);
    }

    #[test]
    fn mixed_chart_nests_deciduous_rows_inside() {
        let numbers: Vec<i16> = Dentition::Mixed.teeth().iter().map(|t| t.number()).collect();
        assert_eq!(numbers[16], 55);
        assert_eq!(numbers[26], 85);
        assert_eq!(numbers[36], 48);
    }

    #[test]
    fn face_labels_depend_on_tooth_position() {
        let upper_incisor = Tooth::new(11).unwrap();
        let lower_molar = Tooth::new(36).unwrap();
        assert_eq!(Face::Lingual.label_for(upper_incisor), "palatal");
        assert_eq!(Face::Occlusal.label_for(upper_incisor), "incisal");
        assert_eq!(Face::Lingual.label_for(lower_molar), "lingual");
        assert_eq!(Face::Occlusal.label_for(lower_molar), "occlusal");
        assert_eq!(Face::Lingual.label_for(Tooth::new(64).unwrap()), "palatal");
    }

    #[test]
    fn face_codes_reject_out_of_range() {
        assert_eq!(Face::from_code(4), Ok(Face::Occlusal));
        assert_eq!(Face::from_code(5), Err(OdontogramError::InvalidFace(5)));
    }

    #[test]
    fn scope_decides_whether_face_is_required() {
        assert!(validate_entry("CAR", DiagnosisScope::Face, Some(Face::Mesial)).is_ok());
        assert!(validate_entry("MIS", DiagnosisScope::Tooth, None).is_ok());
        assert_eq!(
            validate_entry("CAR", DiagnosisScope::Face, None),
            Err(OdontogramError::FaceRequired("CAR".into()))
        );
        assert_eq!(
            validate_entry("MIS", DiagnosisScope::Tooth, Some(Face::Distal)),
            Err(OdontogramError::FaceNotAllowed("MIS".into()))
        );
    }

    #[test]
    fn dentition_parse_defaults_to_permanent() {
        assert_eq!(Dentition::parse(None), Ok(Dentition::Permanent));
        assert_eq!(Dentition::parse(Some("mixed")), Ok(Dentition::Mixed));
        assert!(Dentition::parse(Some("adult")).is_err());
    }

    #[test]
    fn chart_places_marks_on_faces_and_whole_tooth() {
        let chart = build_chart(
            Dentition::Permanent,
            vec![
                entry(16, Some(4), "CAR"),
                entry(16, Some(4), "RES"),
                entry(16, None, "RCT"),
                entry(21, Some(2), "CAR"),
            ],
        );
        assert_eq!(chart.hidden_entries, 0);

        let t16 = chart.teeth.iter().find(|t| t.tooth == 16).unwrap();
        assert_eq!(t16.whole_tooth.len(), 1);
        assert_eq!(t16.whole_tooth[0].code, "RCT");
        let occlusal = t16.faces.iter().find(|f| f.face == Face::Occlusal).unwrap();
        let codes: Vec<&str> = occlusal.marks.iter().map(|m| m.code.as_str()).collect();
        assert_eq!(codes, vec!["CAR", "RES"]);

        let t21 = chart.teeth.iter().find(|t| t.tooth == 21).unwrap();
        let mesial = t21.faces.iter().find(|f| f.face == Face::Mesial).unwrap();
        assert_eq!(mesial.marks.len(), 1);
        assert_eq!(t21.faces.iter().find(|f| f.face == Face::Occlusal).unwrap().label, "incisal");
    }

    #[test]
    fn entries_outside_dentition_are_hidden_not_dropped_silently() {
        let chart = build_chart(
            Dentition::Permanent,
            vec![entry(55, None, "MIS"), entry(99, None, "MIS"), entry(11, Some(9), "CAR")],
        );
        assert_eq!(chart.hidden_entries, 3);
        assert!(chart.teeth.iter().all(|t| t.whole_tooth.is_empty()));
    }

    #[test]
    fn dentition_membership() {
        let permanent = Tooth::new(16).unwrap();
        let primary = Tooth::new(55).unwrap();
        assert!(Dentition::Permanent.contains(permanent));
        assert!(!Dentition::Permanent.contains(primary));
        assert!(Dentition::Deciduous.contains(primary));
        assert!(!Dentition::Deciduous.contains(permanent));
        assert!(Dentition::Mixed.contains(permanent) && Dentition::Mixed.contains(primary));

        let chart = build_chart(Dentition::Deciduous, vec![entry(16, None, "MIS"), entry(55, None, "MIS")]);
        assert_eq!(chart.hidden_entries, 1);
        assert_eq!(chart.teeth.iter().map(|t| t.whole_tooth.len()).sum::<usize>(), 1);
    }
}
