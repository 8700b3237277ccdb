//! Well-known UIDs used during negotiation and by the composite services

/// DICOM Application Context Name
pub const APPLICATION_CONTEXT: &str = "1.2.840.10008.3.1.1.1";

/// Implementation Class UID advertised in the User Information item
pub const IMPLEMENTATION_CLASS_UID: &str = "1.2.826.0.1.3680043.10.1422.1";

/// Implementation Version Name advertised in the User Information item
pub const IMPLEMENTATION_VERSION_NAME: &str = "DIMSE_RS_020";

// Transfer syntaxes
pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
pub const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";
pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
pub const JPEG_EXTENDED: &str = "1.2.840.10008.1.2.4.51";
pub const JPEG_LOSSLESS: &str = "1.2.840.10008.1.2.4.57";
pub const JPEG_LOSSLESS_SV1: &str = "1.2.840.10008.1.2.4.70";
pub const JPEG_LS_LOSSLESS: &str = "1.2.840.10008.1.2.4.80";
pub const JPEG_LS_NEAR_LOSSLESS: &str = "1.2.840.10008.1.2.4.81";
pub const JPEG_2000_LOSSLESS: &str = "1.2.840.10008.1.2.4.90";
pub const JPEG_2000: &str = "1.2.840.10008.1.2.4.91";
pub const MPEG2_MAIN_PROFILE: &str = "1.2.840.10008.1.2.4.100";
pub const MPEG4_HIGH_PROFILE: &str = "1.2.840.10008.1.2.4.102";
pub const RLE_LOSSLESS: &str = "1.2.840.10008.1.2.5";

/// Explicit VR transfer syntaxes this implementation recognizes, in no particular order.
const EXPLICIT_TRANSFER_SYNTAXES: &[&str] = &[
    EXPLICIT_VR_LITTLE_ENDIAN,
    DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN,
    EXPLICIT_VR_BIG_ENDIAN,
    JPEG_BASELINE,
    JPEG_EXTENDED,
    JPEG_LOSSLESS,
    JPEG_LOSSLESS_SV1,
    JPEG_LS_LOSSLESS,
    JPEG_LS_NEAR_LOSSLESS,
    JPEG_2000_LOSSLESS,
    JPEG_2000,
    MPEG2_MAIN_PROFILE,
    MPEG4_HIGH_PROFILE,
    RLE_LOSSLESS,
];

/// Whether the transfer syntax is a recognized explicit VR encoding.
pub fn is_explicit_vr(uid: &str) -> bool {
    EXPLICIT_TRANSFER_SYNTAXES.contains(&uid)
}

/// Whether pixel data under this transfer syntax is encapsulated (compressed).
pub fn is_encapsulated(uid: &str) -> bool {
    uid.starts_with("1.2.840.10008.1.2.4.") || uid == RLE_LOSSLESS
}

/// Whether the transfer syntax is one of the native encodings that can be
/// re-encoded without touching pixel data.
pub fn is_native(uid: &str) -> bool {
    matches!(
        uid,
        IMPLICIT_VR_LITTLE_ENDIAN | EXPLICIT_VR_LITTLE_ENDIAN | EXPLICIT_VR_BIG_ENDIAN
    )
}

// Service classes
pub const VERIFICATION: &str = "1.2.840.10008.1.1";

pub const PATIENT_ROOT_QR_FIND: &str = "1.2.840.10008.5.1.4.1.2.1.1";
pub const PATIENT_ROOT_QR_MOVE: &str = "1.2.840.10008.5.1.4.1.2.1.2";
pub const PATIENT_ROOT_QR_GET: &str = "1.2.840.10008.5.1.4.1.2.1.3";
pub const STUDY_ROOT_QR_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
pub const STUDY_ROOT_QR_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";
pub const STUDY_ROOT_QR_GET: &str = "1.2.840.10008.5.1.4.1.2.2.3";
pub const PATIENT_STUDY_ONLY_QR_FIND: &str = "1.2.840.10008.5.1.4.1.2.3.1";
pub const PATIENT_STUDY_ONLY_QR_MOVE: &str = "1.2.840.10008.5.1.4.1.2.3.2";
pub const PATIENT_STUDY_ONLY_QR_GET: &str = "1.2.840.10008.5.1.4.1.2.3.3";

pub const QUERY_FIND_SOP_CLASSES: &[&str] = &[
    PATIENT_ROOT_QR_FIND,
    STUDY_ROOT_QR_FIND,
    PATIENT_STUDY_ONLY_QR_FIND,
];

pub const RETRIEVE_MOVE_SOP_CLASSES: &[&str] = &[
    PATIENT_ROOT_QR_MOVE,
    STUDY_ROOT_QR_MOVE,
    PATIENT_STUDY_ONLY_QR_MOVE,
];

pub const RETRIEVE_GET_SOP_CLASSES: &[&str] = &[
    PATIENT_ROOT_QR_GET,
    STUDY_ROOT_QR_GET,
    PATIENT_STUDY_ONLY_QR_GET,
];

// Storage
pub const COMPUTED_RADIOGRAPHY_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.1";
pub const DIGITAL_X_RAY_IMAGE_STORAGE_PRESENTATION: &str = "1.2.840.10008.5.1.4.1.1.1.1";
pub const DIGITAL_X_RAY_IMAGE_STORAGE_PROCESSING: &str = "1.2.840.10008.5.1.4.1.1.1.1.1";
pub const DIGITAL_MAMMOGRAPHY_IMAGE_STORAGE_PRESENTATION: &str = "1.2.840.10008.5.1.4.1.1.1.2";
pub const DIGITAL_MAMMOGRAPHY_IMAGE_STORAGE_PROCESSING: &str = "1.2.840.10008.5.1.4.1.1.1.2.1";
pub const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
pub const ENHANCED_CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2.1";
pub const ULTRASOUND_MULTIFRAME_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.3.1";
pub const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
pub const ENHANCED_MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4.1";
pub const ULTRASOUND_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.6.1";
pub const SECONDARY_CAPTURE_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.7";
pub const MULTIFRAME_GRAYSCALE_BYTE_SC_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.7.2";
pub const MULTIFRAME_GRAYSCALE_WORD_SC_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.7.3";
pub const MULTIFRAME_TRUE_COLOR_SC_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.7.4";
pub const TWELVE_LEAD_ECG_WAVEFORM_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.9.1.1";
pub const GRAYSCALE_SOFTCOPY_PRESENTATION_STATE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.11.1";
pub const X_RAY_ANGIOGRAPHIC_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.12.1";
pub const X_RAY_RADIOFLUOROSCOPIC_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.12.2";
pub const X_RAY_3D_ANGIOGRAPHIC_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.13.1.1";
pub const BREAST_TOMOSYNTHESIS_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.13.1.3";
pub const NUCLEAR_MEDICINE_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.20";
pub const RAW_DATA_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.66";
pub const SPATIAL_REGISTRATION_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.66.1";
pub const SEGMENTATION_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.66.4";
pub const VL_PHOTOGRAPHIC_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.77.1.4";
pub const BASIC_TEXT_SR_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.88.11";
pub const ENHANCED_SR_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.88.22";
pub const COMPREHENSIVE_SR_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.88.33";
pub const KEY_OBJECT_SELECTION_DOCUMENT_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.88.59";
pub const X_RAY_RADIATION_DOSE_SR_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.88.67";
pub const ENCAPSULATED_PDF_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.104.1";
pub const POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.128";
pub const RT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.481.1";
pub const RT_DOSE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.481.2";
pub const RT_STRUCTURE_SET_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.481.3";
pub const RT_PLAN_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.481.5";

pub const STORAGE_SOP_CLASSES: &[&str] = &[
    COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
    DIGITAL_X_RAY_IMAGE_STORAGE_PRESENTATION,
    DIGITAL_X_RAY_IMAGE_STORAGE_PROCESSING,
    DIGITAL_MAMMOGRAPHY_IMAGE_STORAGE_PRESENTATION,
    DIGITAL_MAMMOGRAPHY_IMAGE_STORAGE_PROCESSING,
    CT_IMAGE_STORAGE,
    ENHANCED_CT_IMAGE_STORAGE,
    ULTRASOUND_MULTIFRAME_IMAGE_STORAGE,
    MR_IMAGE_STORAGE,
    ENHANCED_MR_IMAGE_STORAGE,
    ULTRASOUND_IMAGE_STORAGE,
    SECONDARY_CAPTURE_IMAGE_STORAGE,
    MULTIFRAME_GRAYSCALE_BYTE_SC_IMAGE_STORAGE,
    MULTIFRAME_GRAYSCALE_WORD_SC_IMAGE_STORAGE,
    MULTIFRAME_TRUE_COLOR_SC_IMAGE_STORAGE,
    TWELVE_LEAD_ECG_WAVEFORM_STORAGE,
    GRAYSCALE_SOFTCOPY_PRESENTATION_STATE_STORAGE,
    X_RAY_ANGIOGRAPHIC_IMAGE_STORAGE,
    X_RAY_RADIOFLUOROSCOPIC_IMAGE_STORAGE,
    X_RAY_3D_ANGIOGRAPHIC_IMAGE_STORAGE,
    BREAST_TOMOSYNTHESIS_IMAGE_STORAGE,
    NUCLEAR_MEDICINE_IMAGE_STORAGE,
    RAW_DATA_STORAGE,
    SPATIAL_REGISTRATION_STORAGE,
    SEGMENTATION_STORAGE,
    VL_PHOTOGRAPHIC_IMAGE_STORAGE,
    BASIC_TEXT_SR_STORAGE,
    ENHANCED_SR_STORAGE,
    COMPREHENSIVE_SR_STORAGE,
    KEY_OBJECT_SELECTION_DOCUMENT_STORAGE,
    X_RAY_RADIATION_DOSE_SR_STORAGE,
    ENCAPSULATED_PDF_STORAGE,
    POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
    RT_IMAGE_STORAGE,
    RT_DOSE_STORAGE,
    RT_STRUCTURE_SET_STORAGE,
    RT_PLAN_STORAGE,
];

/// Whether the SOP class is one of the storage classes this implementation knows.
pub fn is_storage_sop_class(uid: &str) -> bool {
    STORAGE_SOP_CLASSES.contains(&uid)
}
