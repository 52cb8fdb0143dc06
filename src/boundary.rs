use std::fmt::Write as _;

use sha2::{Digest, Sha256};

use dorure_boundary_contract::{
    EXPORT_KIND_PDF, Entitlement, ExportAction, ExportRecord, RecordOutcome, SavedSignature,
};

use crate::debug::DebugLogger;
use crate::error::DorureError;

/// Read side of the plan boundary: who the caller is and what their
/// plan allows right now.
pub trait EntitlementSource {
    fn entitlement(&self) -> Result<Entitlement, DorureError>;
}

/// Write side: usage records plus the saved-signature library. The
/// engine never interprets signature payloads, it only passes the
/// data-URI strings through.
pub trait UsageLedger {
    fn record_export(&self, record: &ExportRecord) -> Result<RecordOutcome, DorureError>;
    fn saved_signatures(&self) -> Result<Vec<SavedSignature>, DorureError>;
    fn save_signature(&self, name: &str, data_uri: &str) -> Result<String, DorureError>;
    fn delete_signature(&self, id: &str) -> Result<bool, DorureError>;
}

/// A finished export: the bytes plus the suggested file name for the
/// caller's download surface.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportOutput {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Strips a `.pdf` extension case-insensitively; any other name comes
/// back untouched.
pub fn pdf_base_name(original: &str) -> &str {
    let len = original.len();
    match original.get(len.saturating_sub(4)..) {
        Some(tail) if tail.eq_ignore_ascii_case(".pdf") => &original[..len - 4],
        _ => original,
    }
}

pub fn export_file_name(original: &str, action: ExportAction) -> String {
    let base = pdf_base_name(original);
    match action {
        ExportAction::Sign => format!("{base}_signe.pdf"),
        ExportAction::Fill => format!("{base}_rempli.pdf"),
        ExportAction::Compress => format!("{base}_compressé.pdf"),
        ExportAction::Convert => crate::convert::archive_file_name(base),
    }
}

/// The quota check runs before any rendering work starts, so a caller
/// over the daily limit pays nothing for the refusal.
pub(crate) fn ensure_quota(entitlement: &Entitlement) -> Result<(), DorureError> {
    if entitlement.remaining() == Some(0) {
        return Err(DorureError::QuotaExceeded);
    }
    Ok(())
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

pub(crate) fn export_record(
    original: &str,
    file_name: &str,
    action: ExportAction,
    bytes: &[u8],
) -> ExportRecord {
    ExportRecord {
        filename: file_name.to_string(),
        original_name: original.to_string(),
        kind: EXPORT_KIND_PDF.to_string(),
        action,
        size_bytes: bytes.len() as u64,
        sha256: sha256_hex(bytes),
    }
}

/// Usage recording is fire-and-forget: a refused or failed record is
/// one warning line in the debug log, never a failed export.
pub(crate) fn record_quietly(
    ledger: Option<&dyn UsageLedger>,
    record: &ExportRecord,
    debug: Option<&DebugLogger>,
) {
    let Some(ledger) = ledger else {
        return;
    };
    match ledger.record_export(record) {
        Ok(RecordOutcome::Recorded { .. }) => {}
        Ok(RecordOutcome::LimitReached) => {
            if let Some(debug) = debug {
                debug.warn("usage_record_refused", &record.filename);
            }
        }
        Err(err) => {
            if let Some(debug) = debug {
                debug.warn("usage_record_failed", &err.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct CapturingLedger {
        records: Mutex<Vec<ExportRecord>>,
    }

    impl CapturingLedger {
        fn new() -> Self {
            CapturingLedger {
                records: Mutex::new(Vec::new()),
            }
        }
    }

    impl UsageLedger for CapturingLedger {
        fn record_export(&self, record: &ExportRecord) -> Result<RecordOutcome, DorureError> {
            self.records.lock().unwrap().push(record.clone());
            Ok(RecordOutcome::Recorded { today_count: 1 })
        }

        fn saved_signatures(&self) -> Result<Vec<SavedSignature>, DorureError> {
            Ok(Vec::new())
        }

        fn save_signature(&self, _name: &str, _data_uri: &str) -> Result<String, DorureError> {
            Ok("sig_1".to_string())
        }

        fn delete_signature(&self, _id: &str) -> Result<bool, DorureError> {
            Ok(true)
        }
    }

    struct FailingLedger;

    impl UsageLedger for FailingLedger {
        fn record_export(&self, _record: &ExportRecord) -> Result<RecordOutcome, DorureError> {
            Err(DorureError::Io(io::Error::other("boundary offline")))
        }

        fn saved_signatures(&self) -> Result<Vec<SavedSignature>, DorureError> {
            Err(DorureError::Io(io::Error::other("boundary offline")))
        }

        fn save_signature(&self, _name: &str, _data_uri: &str) -> Result<String, DorureError> {
            Err(DorureError::Io(io::Error::other("boundary offline")))
        }

        fn delete_signature(&self, _id: &str) -> Result<bool, DorureError> {
            Err(DorureError::Io(io::Error::other("boundary offline")))
        }
    }

    #[test]
    fn file_names_follow_the_action_suffixes() {
        assert_eq!(
            export_file_name("Contrat.PDF", ExportAction::Sign),
            "Contrat_signe.pdf"
        );
        assert_eq!(
            export_file_name("dossier.pdf", ExportAction::Fill),
            "dossier_rempli.pdf"
        );
        assert_eq!(
            export_file_name("scan", ExportAction::Compress),
            "scan_compressé.pdf"
        );
        assert_eq!(
            export_file_name("rapport.pdf", ExportAction::Convert),
            "rapport_images.zip"
        );
        assert_eq!(pdf_base_name("déjà.pdf"), "déjà");
        assert_eq!(pdf_base_name("x"), "x");
    }

    #[test]
    fn quota_gate_blocks_only_an_exhausted_limit() {
        let spent = Entitlement::evaluate("free", 2);
        let err = ensure_quota(&spent).unwrap_err();
        assert!(err.to_string().contains("daily document quota"));

        assert!(ensure_quota(&Entitlement::evaluate("free", 1)).is_ok());
        assert!(ensure_quota(&Entitlement::evaluate("pro", 10_000)).is_ok());
    }

    #[test]
    fn export_record_carries_digest_and_size() {
        let bytes = b"%PDF-1.5 fake";
        let record = export_record(
            "contrat.pdf",
            "contrat_signe.pdf",
            ExportAction::Sign,
            bytes,
        );
        assert_eq!(record.original_name, "contrat.pdf");
        assert_eq!(record.filename, "contrat_signe.pdf");
        assert_eq!(record.kind, "pdf");
        assert_eq!(record.size_bytes, bytes.len() as u64);
        assert_eq!(record.sha256.len(), 64);
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn recording_reaches_the_ledger_once() {
        let ledger = CapturingLedger::new();
        let record = export_record("a.pdf", "a_signe.pdf", ExportAction::Sign, b"bytes");
        record_quietly(Some(&ledger), &record, None);
        let seen = ledger.records.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].action, ExportAction::Sign);
    }

    #[test]
    fn a_failing_ledger_only_warns_in_the_debug_log() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos();
        let path = std::env::temp_dir().join(format!(
            "dorure-boundary-{}-{}.log",
            std::process::id(),
            nanos
        ));
        let debug = DebugLogger::new(&path).unwrap();

        let record = export_record("a.pdf", "a_signe.pdf", ExportAction::Sign, b"bytes");
        record_quietly(Some(&FailingLedger), &record, Some(&debug));
        record_quietly(None, &record, Some(&debug));
        debug.flush();

        let logged = std::fs::read_to_string(&path).unwrap();
        assert_eq!(logged.matches("usage_record_failed").count(), 1);
        let _ = std::fs::remove_file(&path);
    }
}
