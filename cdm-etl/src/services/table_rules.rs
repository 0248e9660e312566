//! Row-generation rules per standardized table
//!
//! Each rule lists where to find the coded fields, the event date and the
//! value of a source record, separately for tabular rows (column names) and
//! typed documents (dotted JSON paths).

use crate::models::{CdmTable, RawRecord};

/// Candidate locations for one table
#[derive(Debug, Clone, Copy)]
pub struct TableRule {
    pub table: CdmTable,
    pub row_codes: &'static [&'static str],
    pub resource_codes: &'static [&'static str],
    pub row_dates: &'static [&'static str],
    pub resource_dates: &'static [&'static str],
    pub row_values: &'static [&'static str],
    pub resource_values: &'static [&'static str],
    /// Column name of the event date in the standardized row
    pub date_column: &'static str,
}

const ROW_PATIENT: &[&str] = &["patient_id", "person_id", "mrn", "subject_id", "member_id"];
const RESOURCE_PATIENT: &[&str] = &["subject.reference", "patient.reference"];
const ROW_ENCOUNTER: &[&str] = &["encounter_id", "visit_id", "visit_occurrence_id"];
const RESOURCE_ENCOUNTER: &[&str] = &["encounter.reference", "context.reference"];
const ROW_UNIT: &[&str] = &["unit", "units", "unit_of_measure"];
const RESOURCE_UNIT: &[&str] = &["valueQuantity.unit", "valueQuantity.code"];

const RULES: [TableRule; 7] = [
    TableRule {
        table: CdmTable::Person,
        row_codes: &["gender", "sex", "gender_code"],
        resource_codes: &["gender"],
        row_dates: &["birth_date", "date_of_birth", "dob"],
        resource_dates: &["birthDate"],
        row_values: &[],
        resource_values: &[],
        date_column: "birth_datetime",
    },
    TableRule {
        table: CdmTable::VisitOccurrence,
        row_codes: &["visit_type", "encounter_type", "encounter_class", "visit_code"],
        resource_codes: &["class.code", "type.0.coding.0.code"],
        row_dates: &["visit_start_date", "admission_date", "encounter_date", "visit_date"],
        resource_dates: &["period.start"],
        row_values: &[],
        resource_values: &[],
        date_column: "visit_start_date",
    },
    TableRule {
        table: CdmTable::ConditionOccurrence,
        row_codes: &["diagnosis_code", "condition_code", "icd10_code", "icd_code", "dx_code"],
        resource_codes: &["code.coding.0.code", "code.coding.1.code"],
        row_dates: &["onset_date", "diagnosis_date", "condition_start_date", "date"],
        resource_dates: &["onsetDateTime", "recordedDate"],
        row_values: &[],
        resource_values: &[],
        date_column: "condition_start_date",
    },
    TableRule {
        table: CdmTable::DrugExposure,
        row_codes: &["drug_code", "medication_code", "ndc_code", "rxnorm_code", "ndc"],
        resource_codes: &[
            "medicationCodeableConcept.coding.0.code",
            "vaccineCode.coding.0.code",
        ],
        row_dates: &["start_date", "prescription_date", "drug_exposure_start_date", "date"],
        resource_dates: &["authoredOn", "effectiveDateTime", "occurrenceDateTime"],
        row_values: &["quantity", "dose", "dosage"],
        resource_values: &["dispenseRequest.quantity.value", "dosageInstruction.0.text"],
        date_column: "drug_exposure_start_date",
    },
    TableRule {
        table: CdmTable::ProcedureOccurrence,
        row_codes: &["procedure_code", "cpt_code", "hcpcs_code", "icd10_pcs_code"],
        resource_codes: &["code.coding.0.code", "code.coding.1.code"],
        row_dates: &["procedure_date", "service_date", "date"],
        resource_dates: &["performedDateTime", "performedPeriod.start"],
        row_values: &[],
        resource_values: &[],
        date_column: "procedure_date",
    },
    TableRule {
        table: CdmTable::Measurement,
        row_codes: &["loinc_code", "lab_code", "test_code", "measurement_code"],
        resource_codes: &["code.coding.0.code", "code.coding.1.code"],
        row_dates: &["result_date", "collection_date", "measurement_date", "date"],
        resource_dates: &["effectiveDateTime", "issued"],
        row_values: &["value", "result_value", "result", "value_as_number"],
        resource_values: &["valueQuantity.value", "valueString", "valueCodeableConcept.text"],
        date_column: "measurement_date",
    },
    TableRule {
        table: CdmTable::Observation,
        row_codes: &["observation_code", "allergy_code", "allergen_code", "code"],
        resource_codes: &["code.coding.0.code", "code.coding.1.code"],
        row_dates: &["observation_date", "recorded_date", "date"],
        resource_dates: &["recordedDate", "onsetDateTime", "effectiveDateTime"],
        row_values: &["value", "value_as_string", "reaction"],
        resource_values: &["reaction.0.manifestation.0.text", "valueString"],
        date_column: "observation_date",
    },
];

/// Rule for a table
pub fn rule_for(table: CdmTable) -> &'static TableRule {
    RULES
        .iter()
        .find(|r| r.table == table)
        .unwrap_or(&RULES[RULES.len() - 1])
}

/// A coded field found in a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodedField {
    /// Column name or JSON path the code was read from
    pub field_path: String,
    pub code: String,
}

impl TableRule {
    /// Coded fields present in a record, in rule order
    pub fn coded_fields(&self, record: &RawRecord) -> Vec<CodedField> {
        let candidates = match record {
            RawRecord::Row { .. } => self.row_codes,
            RawRecord::Resource { .. } => self.resource_codes,
        };
        candidates
            .iter()
            .filter_map(|path| {
                record.field(path).map(|code| CodedField {
                    field_path: path.to_string(),
                    code: code.trim().to_string(),
                })
            })
            .collect()
    }

    /// Coded fields grouped by the fact they describe
    ///
    /// Each row column is its own fact. A document's codings are alternative
    /// codes for one concept, so they form a single group.
    pub fn coded_facts(&self, record: &RawRecord) -> Vec<Vec<CodedField>> {
        let coded = self.coded_fields(record);
        match record {
            RawRecord::Row { .. } => coded.into_iter().map(|field| vec![field]).collect(),
            RawRecord::Resource { .. } if coded.is_empty() => Vec::new(),
            RawRecord::Resource { .. } => vec![coded],
        }
    }

    pub fn event_date(&self, record: &RawRecord) -> Option<String> {
        match record {
            RawRecord::Row { .. } => first_present(record, self.row_dates),
            RawRecord::Resource { .. } => first_present(record, self.resource_dates),
        }
    }

    pub fn value(&self, record: &RawRecord) -> Option<String> {
        match record {
            RawRecord::Row { .. } => first_present(record, self.row_values),
            RawRecord::Resource { .. } => first_present(record, self.resource_values),
        }
    }
}

/// Unit of a measured value
pub fn unit(record: &RawRecord) -> Option<String> {
    match record {
        RawRecord::Row { .. } => first_present(record, ROW_UNIT),
        RawRecord::Resource { .. } => first_present(record, RESOURCE_UNIT),
    }
}

/// Patient identifier of a record
///
/// Patient documents use their own `id`; references drop the `Patient/` prefix.
pub fn patient_id(record: &RawRecord) -> Option<String> {
    match record {
        RawRecord::Row { .. } => first_present(record, ROW_PATIENT),
        RawRecord::Resource { resource_type, .. } => {
            if resource_type.eq_ignore_ascii_case("Patient") {
                return record.field("id").map(|id| id.trim().to_string());
            }
            first_present(record, RESOURCE_PATIENT).map(|r| strip_reference(&r, "Patient"))
        }
    }
}

/// Encounter identifier of a record
pub fn encounter_id(record: &RawRecord) -> Option<String> {
    match record {
        RawRecord::Row { .. } => first_present(record, ROW_ENCOUNTER),
        RawRecord::Resource { resource_type, .. } => {
            if resource_type.eq_ignore_ascii_case("Encounter") {
                return record.field("id").map(|id| id.trim().to_string());
            }
            first_present(record, RESOURCE_ENCOUNTER).map(|r| strip_reference(&r, "Encounter"))
        }
    }
}

fn first_present(record: &RawRecord, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .find_map(|path| record.field(path))
        .map(|v| v.trim().to_string())
}

fn strip_reference(reference: &str, resource_type: &str) -> String {
    let reference = reference.trim();
    reference
        .strip_prefix(resource_type)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(reference)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, &str)]) -> RawRecord {
        RawRecord::Row {
            fields: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_every_table_has_a_rule() {
        for table in CdmTable::PRIORITY {
            assert_eq!(rule_for(table).table, table);
        }
    }

    #[test]
    fn test_row_yields_one_field_per_present_code() {
        let record = row(&[
            ("patient_id", "P1"),
            ("diagnosis_code", "E11.9"),
            ("icd10_code", "I10"),
            ("onset_date", "2024-01-05"),
        ]);
        let rule = rule_for(CdmTable::ConditionOccurrence);
        let coded = rule.coded_fields(&record);
        assert_eq!(coded.len(), 2);
        assert_eq!(coded[0].field_path, "diagnosis_code");
        assert_eq!(coded[1].code, "I10");
        assert_eq!(rule.event_date(&record).as_deref(), Some("2024-01-05"));
    }

    #[test]
    fn test_resource_paths_and_references() {
        let record = RawRecord::classify(json!({
            "resourceType": "Condition",
            "subject": {"reference": "Patient/123"},
            "encounter": {"reference": "Encounter/e-9"},
            "code": {"coding": [{"system": "http://snomed.info/sct", "code": "44054006"}]},
            "onsetDateTime": "2023-06-01"
        }))
        .unwrap();

        let rule = rule_for(CdmTable::ConditionOccurrence);
        let coded = rule.coded_fields(&record);
        assert_eq!(coded, vec![CodedField {
            field_path: "code.coding.0.code".to_string(),
            code: "44054006".to_string(),
        }]);
        assert_eq!(patient_id(&record).as_deref(), Some("123"));
        assert_eq!(encounter_id(&record).as_deref(), Some("e-9"));
    }

    #[test]
    fn test_document_codings_form_one_fact() {
        let record = RawRecord::classify(json!({
            "resourceType": "Condition",
            "code": {"coding": [
                {"system": "http://snomed.info/sct", "code": "44054006"},
                {"system": "ICD10CM", "code": "E11.9"}
            ]}
        }))
        .unwrap();
        let facts = rule_for(CdmTable::ConditionOccurrence).coded_facts(&record);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].len(), 2);
        assert_eq!(facts[0][1].code, "E11.9");

        let record = row(&[("diagnosis_code", "E11.9"), ("icd10_code", "I10")]);
        assert_eq!(rule_for(CdmTable::ConditionOccurrence).coded_facts(&record).len(), 2);
    }

    #[test]
    fn test_patient_document_uses_own_id() {
        let record = RawRecord::classify(json!({
            "resourceType": "Patient",
            "id": "p-7",
            "gender": "female"
        }))
        .unwrap();
        assert_eq!(patient_id(&record).as_deref(), Some("p-7"));
        assert_eq!(rule_for(CdmTable::Person).coded_fields(&record)[0].code, "female");
    }

    #[test]
    fn test_measurement_value_and_unit() {
        let record = row(&[("loinc_code", "2345-7"), ("result_value", "5.4"), ("unit", "mmol/L")]);
        assert_eq!(rule_for(CdmTable::Measurement).value(&record).as_deref(), Some("5.4"));
        assert_eq!(unit(&record).as_deref(), Some("mmol/L"));
    }
}
