//! Attribute matching for stored instances
//!
//! Each stored instance keeps a flat map of the keys below, taken from its
//! data set when it was received. Identifiers are matched against that map
//! rather than against the data sets themselves.

use std::collections::{BTreeMap, HashSet};

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

use crate::storage::InstanceRecord;

/// Keys recorded for every stored instance
pub const KEYS: &[(&str, Tag)] = &[
    ("PatientName", tags::PATIENT_NAME),
    ("PatientID", tags::PATIENT_ID),
    ("PatientBirthDate", tags::PATIENT_BIRTH_DATE),
    ("PatientSex", tags::PATIENT_SEX),
    ("StudyInstanceUID", tags::STUDY_INSTANCE_UID),
    ("StudyDate", tags::STUDY_DATE),
    ("StudyTime", tags::STUDY_TIME),
    ("StudyID", tags::STUDY_ID),
    ("AccessionNumber", tags::ACCESSION_NUMBER),
    ("StudyDescription", tags::STUDY_DESCRIPTION),
    ("SeriesInstanceUID", tags::SERIES_INSTANCE_UID),
    ("SeriesNumber", tags::SERIES_NUMBER),
    ("Modality", tags::MODALITY),
    ("SeriesDescription", tags::SERIES_DESCRIPTION),
    ("SOPInstanceUID", tags::SOP_INSTANCE_UID),
    ("SOPClassUID", tags::SOP_CLASS_UID),
    ("InstanceNumber", tags::INSTANCE_NUMBER),
];

const UID_KEYS: &[&str] = &["StudyInstanceUID", "SeriesInstanceUID", "SOPInstanceUID", "SOPClassUID"];
const DATE_KEYS: &[&str] = &["PatientBirthDate", "StudyDate"];

fn keyword(tag: Tag) -> Option<&'static str> {
    KEYS.iter().find(|(_, t)| *t == tag).map(|(k, _)| *k)
}

fn text_value(object: &InMemDicomObject, tag: Tag) -> Option<String> {
    let value = object.element(tag).ok()?.to_str().ok()?;
    let value = value.trim_end_matches(['\0', ' ']).trim_start();
    (!value.is_empty()).then(|| value.to_string())
}

/// Collects the recorded keys present in a data set.
pub fn extract_keys(object: &InMemDicomObject) -> BTreeMap<String, String> {
    KEYS.iter()
        .filter_map(|(name, tag)| text_value(object, *tag).map(|v| (name.to_string(), v)))
        .collect()
}

/// Query/Retrieve level of an identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryLevel {
    Patient,
    Study,
    Series,
    Image,
}

impl QueryLevel {
    /// Level named by the identifier. Without one every instance is its own
    /// match.
    pub fn of(identifier: &InMemDicomObject) -> Self {
        match text_value(identifier, tags::QUERY_RETRIEVE_LEVEL).as_deref() {
            Some("PATIENT") => QueryLevel::Patient,
            Some("STUDY") => QueryLevel::Study,
            Some("SERIES") => QueryLevel::Series,
            _ => QueryLevel::Image,
        }
    }

    /// Key that identifies one entity at this level
    pub fn unique_key(self) -> &'static str {
        match self {
            QueryLevel::Patient => "PatientID",
            QueryLevel::Study => "StudyInstanceUID",
            QueryLevel::Series => "SeriesInstanceUID",
            QueryLevel::Image => "SOPInstanceUID",
        }
    }
}

/// Matching criteria taken from the non-empty recorded keys of an identifier
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    terms: Vec<(&'static str, String)>,
}

impl Criteria {
    pub fn from_identifier(identifier: &InMemDicomObject) -> Self {
        let terms = KEYS
            .iter()
            .filter_map(|(name, tag)| text_value(identifier, *tag).map(|v| (*name, v)))
            .collect();
        Self { terms }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn matches(&self, keys: &BTreeMap<String, String>) -> bool {
        self.terms.iter().all(|(name, pattern)| match keys.get(*name) {
            Some(value) => term_matches(name, pattern, value),
            None => false,
        })
    }
}

fn term_matches(name: &str, pattern: &str, value: &str) -> bool {
    if UID_KEYS.contains(&name) {
        return pattern.split('\\').any(|uid| uid.trim() == value);
    }
    if DATE_KEYS.contains(&name) {
        if let Some((from, to)) = pattern.split_once('-') {
            return (from.is_empty() || value >= from) && (to.is_empty() || value <= to);
        }
    }
    if name == "PatientName" {
        return wildcard_match(&pattern.to_uppercase(), &value.to_uppercase());
    }
    wildcard_match(pattern, value)
}

/// `*` matches any run of characters, `?` exactly one.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();
    let (mut p, mut v) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while v < value.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == value[v]) {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, v));
            p += 1;
        } else if let Some((sp, sv)) = star {
            p = sp + 1;
            v = sv + 1;
            star = Some((sp, sv + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

/// Records matching `identifier`, one per entity at the identifier's level.
pub fn select<'a>(
    records: impl IntoIterator<Item = &'a InstanceRecord>,
    identifier: &InMemDicomObject,
    collapse: bool,
) -> Vec<&'a InstanceRecord> {
    let criteria = Criteria::from_identifier(identifier);
    let level = QueryLevel::of(identifier);
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| criteria.matches(&record.keys))
        .filter(|record| {
            if !collapse {
                return true;
            }
            let key = record.keys.get(level.unique_key()).cloned().unwrap_or_default();
            seen.insert(key)
        })
        .collect()
}

/// Response identifier: the requested attributes filled from the record.
pub fn response(identifier: &InMemDicomObject, record: &InstanceRecord) -> InMemDicomObject {
    let mut out = InMemDicomObject::new_empty();
    for element in identifier.iter() {
        let tag = element.header().tag;
        let vr = element.header().vr;
        if vr == VR::SQ {
            continue;
        }
        if tag == tags::QUERY_RETRIEVE_LEVEL || tag == tags::SPECIFIC_CHARACTER_SET {
            out.put(element.clone());
            continue;
        }
        let value = keyword(tag)
            .and_then(|name| record.keys.get(name))
            .map(|v| PrimitiveValue::from(v.as_str()))
            .unwrap_or(PrimitiveValue::Empty);
        out.put(DataElement::new(tag, vr, value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::dicom_value;

    fn keys(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn identifier(elements: Vec<DataElement<InMemDicomObject>>) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(elements)
    }

    #[test]
    fn test_wildcards() {
        assert!(wildcard_match("DOE*", "DOE^JANE"));
        assert!(wildcard_match("*JANE", "DOE^JANE"));
        assert!(wildcard_match("D?E^*", "DOE^JANE"));
        assert!(wildcard_match("*", ""));
        assert!(!wildcard_match("DOE?", "DOE^JANE"));
        assert!(!wildcard_match("SMITH*", "DOE^JANE"));
    }

    #[test]
    fn test_uid_list_and_date_range() {
        let record = keys(&[("StudyInstanceUID", "1.2.3"), ("StudyDate", "20240115")]);

        let uid_list = identifier(vec![DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.9\\1.2.3"),
        )]);
        assert!(Criteria::from_identifier(&uid_list).matches(&record));

        let range = identifier(vec![DataElement::new(tags::STUDY_DATE, VR::DA, dicom_value!(Str, "20240101-20240131"))]);
        assert!(Criteria::from_identifier(&range).matches(&record));

        let open_range = identifier(vec![DataElement::new(tags::STUDY_DATE, VR::DA, dicom_value!(Str, "20240201-"))]);
        assert!(!Criteria::from_identifier(&open_range).matches(&record));
    }

    #[test]
    fn test_empty_keys_are_universal() {
        let universal = identifier(vec![
            DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::Empty),
            DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, dicom_value!(Str, "STUDY")),
        ]);
        let criteria = Criteria::from_identifier(&universal);
        assert!(criteria.is_empty());
        assert!(criteria.matches(&keys(&[])));
        assert_eq!(QueryLevel::of(&universal), QueryLevel::Study);
    }

    #[test]
    fn test_missing_key_does_not_match() {
        let query = identifier(vec![DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, "CT"))]);
        assert!(!Criteria::from_identifier(&query).matches(&keys(&[("PatientID", "P1")])));
    }

    #[test]
    fn test_patient_name_is_case_insensitive() {
        let query = identifier(vec![DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "doe*"))]);
        assert!(Criteria::from_identifier(&query).matches(&keys(&[("PatientName", "DOE^JANE")])));
    }
}
