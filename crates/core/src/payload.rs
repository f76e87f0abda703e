//! Clinical payloads and the capabilities the versioning engine needs from them.
//!
//! The engine in [`crate::record`] is generic over any [`Snapshot`] value; it never looks inside
//! the payload beyond asking it to validate itself. [`ClinicalPayload`] is the concrete
//! clinical schema, and [`EmergencyRelevant`] is the narrow view the emergency profile is
//! allowed to see.

use crate::{RecordError, RecordResult};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A value the versioning engine can copy into immutable history.
///
/// `Clone` produces the full, independent copy stored in a snapshot; serde bounds let stores
/// persist snapshots as full documents rather than deltas.
pub trait Snapshot: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Reject payloads missing required content.
    fn validate(&self) -> RecordResult<()>;
}

/// The emergency-relevant subset of a payload.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct EmergencyFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blood_group: Option<BloodGroup>,
    #[serde(default)]
    pub allergies: Vec<String>,
    #[serde(default)]
    pub chronic_conditions: Vec<String>,
    #[serde(default)]
    pub current_medications: Vec<String>,
    pub primary_diagnosis: String,
}

/// Projection into [`EmergencyFields`]. Implementations must not leak anything else.
pub trait EmergencyRelevant {
    fn emergency_fields(&self) -> EmergencyFields;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum BloodGroup {
    #[serde(rename = "A+")]
    APositive,
    #[serde(rename = "A-")]
    ANegative,
    #[serde(rename = "B+")]
    BPositive,
    #[serde(rename = "B-")]
    BNegative,
    #[serde(rename = "AB+")]
    AbPositive,
    #[serde(rename = "AB-")]
    AbNegative,
    #[serde(rename = "O+")]
    OPositive,
    #[serde(rename = "O-")]
    ONegative,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub primary: String,
    #[serde(default)]
    pub secondary: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icd_code: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vitals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub systolic_bp: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diastolic_bp: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_celsius: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respiratory_rate: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oxygen_saturation: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_kg: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height_cm: Option<f32>,
}

impl Vitals {
    fn validate(&self) -> RecordResult<()> {
        fn out_of_range(field: &str) -> RecordError {
            RecordError::InvalidInput(format!("vitals.{field} is outside the plausible range"))
        }

        if let (Some(sys), Some(dia)) = (self.systolic_bp, self.diastolic_bp) {
            if dia >= sys {
                return Err(RecordError::InvalidInput(
                    "vitals.diastolic_bp must be lower than systolic_bp".into(),
                ));
            }
        }
        if self.systolic_bp.is_some_and(|v| !(40..=300).contains(&v)) {
            return Err(out_of_range("systolic_bp"));
        }
        if self.heart_rate.is_some_and(|v| !(20..=300).contains(&v)) {
            return Err(out_of_range("heart_rate"));
        }
        if self
            .temperature_celsius
            .is_some_and(|v| !(25.0..=45.0).contains(&v))
        {
            return Err(out_of_range("temperature_celsius"));
        }
        if self.oxygen_saturation.is_some_and(|v| v > 100) {
            return Err(out_of_range("oxygen_saturation"));
        }
        if self.weight_kg.is_some_and(|v| !(0.2..=700.0).contains(&v)) {
            return Err(out_of_range("weight_kg"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Medication {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dosage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Treatment {
    #[serde(default)]
    pub medications: Vec<Medication>,
    #[serde(default)]
    pub procedures: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Metadata for an uploaded file. The bytes themselves live with the storage collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// The content of one clinical encounter.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClinicalPayload {
    pub chief_complaint: String,
    pub diagnosis: Diagnosis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vitals: Option<Vitals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treatment: Option<Treatment>,
    #[serde(default)]
    pub attachments: Vec<AttachmentMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blood_group: Option<BloodGroup>,
    #[serde(default)]
    pub allergies: Vec<String>,
    #[serde(default)]
    pub chronic_conditions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_up_date: Option<NaiveDate>,
}

impl Snapshot for ClinicalPayload {
    fn validate(&self) -> RecordResult<()> {
        if self.chief_complaint.trim().is_empty() {
            return Err(RecordError::MissingField("chief_complaint"));
        }
        if self.diagnosis.primary.trim().is_empty() {
            return Err(RecordError::MissingField("diagnosis.primary"));
        }
        if let Some(vitals) = &self.vitals {
            vitals.validate()?;
        }
        if let Some(treatment) = &self.treatment {
            if treatment.medications.iter().any(|m| m.name.trim().is_empty()) {
                return Err(RecordError::MissingField("treatment.medications.name"));
            }
        }
        for attachment in &self.attachments {
            if attachment.file_name.trim().is_empty() {
                return Err(RecordError::MissingField("attachments.file_name"));
            }
            if attachment.size_bytes == 0 {
                return Err(RecordError::InvalidInput(format!(
                    "attachment '{}' is empty",
                    attachment.file_name
                )));
            }
        }
        Ok(())
    }
}

impl EmergencyRelevant for ClinicalPayload {
    fn emergency_fields(&self) -> EmergencyFields {
        let current_medications = self
            .treatment
            .as_ref()
            .map(|t| {
                t.medications
                    .iter()
                    .map(|m| match &m.dosage {
                        Some(dosage) => format!("{} {}", m.name, dosage),
                        None => m.name.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        EmergencyFields {
            blood_group: self.blood_group,
            allergies: self.allergies.clone(),
            chronic_conditions: self.chronic_conditions.clone(),
            current_medications,
            primary_diagnosis: self.diagnosis.primary.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn payload(diagnosis: &str) -> ClinicalPayload {
        ClinicalPayload {
            chief_complaint: "Headache".into(),
            diagnosis: Diagnosis {
                primary: diagnosis.into(),
                ..Diagnosis::default()
            },
            ..ClinicalPayload::default()
        }
    }

    #[test]
    fn requires_chief_complaint_and_primary_diagnosis() {
        let mut p = payload("Hypertension");
        p.validate().unwrap();

        p.chief_complaint = "  ".into();
        assert!(matches!(
            p.validate(),
            Err(RecordError::MissingField("chief_complaint"))
        ));

        let p = payload("");
        assert!(matches!(
            p.validate(),
            Err(RecordError::MissingField("diagnosis.primary"))
        ));
    }

    #[test]
    fn rejects_implausible_vitals() {
        let mut p = payload("Hypertension");
        p.vitals = Some(Vitals {
            systolic_bp: Some(80),
            diastolic_bp: Some(120),
            ..Vitals::default()
        });
        assert!(matches!(p.validate(), Err(RecordError::InvalidInput(_))));
    }

    #[test]
    fn rejects_empty_attachments() {
        let mut p = payload("Fracture");
        p.attachments.push(AttachmentMeta {
            file_name: "xray.png".into(),
            content_type: "image/png".into(),
            size_bytes: 0,
            sha256: None,
        });
        assert!(p.validate().is_err());
    }

    #[test]
    fn emergency_fields_project_only_relevant_data() {
        let mut p = payload("Type 2 diabetes");
        p.blood_group = Some(BloodGroup::ONegative);
        p.allergies = vec!["Penicillin".into()];
        p.treatment = Some(Treatment {
            medications: vec![Medication {
                name: "Metformin".into(),
                dosage: Some("500mg".into()),
                ..Medication::default()
            }],
            notes: Some("private note".into()),
            ..Treatment::default()
        });

        let fields = p.emergency_fields();
        assert_eq!(fields.blood_group, Some(BloodGroup::ONegative));
        assert_eq!(fields.current_medications, vec!["Metformin 500mg"]);
        assert_eq!(fields.primary_diagnosis, "Type 2 diabetes");
        let json = serde_json::to_string(&fields).unwrap();
        assert!(!json.contains("private note"));
        assert!(!json.contains("Headache"));
    }

    #[test]
    fn blood_group_uses_clinical_notation() {
        assert_eq!(
            serde_json::to_string(&BloodGroup::AbNegative).unwrap(),
            "\"AB-\""
        );
    }
}
