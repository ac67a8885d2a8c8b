use serde::{Deserialize, Serialize};

/// Classification the backend assigns to each distinct value found in the
/// mapped reader-identifier column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReaderClass {
    #[serde(rename = "existente")]
    Existing,
    #[serde(rename = "nuevo_seguro")]
    NewSafe,
    #[serde(rename = "problematico")]
    Problematic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderEntry {
    pub id: String,
    #[serde(rename = "estado")]
    pub classification: ReaderClass,
    #[serde(rename = "razon", default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(rename = "sugerencia", default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Pre-commit classification report for the reader-identifier column.
/// Produced by one synchronous request, consumed by the gate decision, then
/// discarded; never cached across attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderValidationReport {
    #[serde(rename = "total_registros", default)]
    pub total_records: u64,
    #[serde(rename = "lectores_nuevos", default)]
    pub new_readers: Vec<ReaderEntry>,
    #[serde(rename = "lectores_problematicos", default)]
    pub problematic_readers: Vec<ReaderEntry>,
    #[serde(rename = "lectores_existentes", default)]
    pub existing_readers: Vec<ReaderEntry>,
    #[serde(rename = "es_seguro_proceder", default)]
    pub safe_to_proceed: bool,
    #[serde(rename = "advertencias", default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the gate decided for this import attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Nothing new and nothing suspicious; commit without interaction.
    Proceed,
    /// New identifiers will be created; an explicit confirmation is
    /// mandatory before committing.
    ConfirmRequired,
    /// Problematic identifiers present (or the backend could not validate);
    /// confirmation is disabled and the only recovery is editing the
    /// mapping or the file.
    Blocked,
}

impl ReaderValidationReport {
    /// A reader column full of plate-shaped values is a strong signal of a
    /// wrong-column mapping, so any problematic entry is a hard block no
    /// matter what the wire flag says.
    pub fn confirm_allowed(&self) -> bool {
        self.error.is_none() && self.problematic_readers.is_empty() && self.safe_to_proceed
    }

    pub fn decision(&self) -> GateDecision {
        if self.error.is_some() || !self.problematic_readers.is_empty() {
            return GateDecision::Blocked;
        }
        if !self.confirm_allowed() {
            return GateDecision::Blocked;
        }
        if self.new_readers.is_empty() {
            GateDecision::Proceed
        } else {
            GateDecision::ConfirmRequired
        }
    }
}
