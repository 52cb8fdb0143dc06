use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

pub const CONTRACT_ID: &str = "dorure.boundary_contract";
pub const CONTRACT_VERSION: &str = "1";

pub const EXPORT_KIND_PDF: &str = "pdf";

const FREE_PLAN_ID: &str = "free";
const FREE_DAILY_LIMIT: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanDef {
    pub id: &'static str,
    pub name: &'static str,
    pub daily_limit: i64,
    pub timestamped_signature: bool,
}

pub const PLANS_V1: [PlanDef; 3] = [
    PlanDef { id: "free", name: "Gratuit", daily_limit: 2, timestamped_signature: false },
    PlanDef { id: "pro", name: "Pro", daily_limit: -1, timestamped_signature: true },
    PlanDef { id: "business", name: "Business", daily_limit: -1, timestamped_signature: true },
];

pub fn plan_defs_v1() -> &'static [PlanDef] {
    &PLANS_V1
}

pub fn plan_def(plan_id: &str) -> Option<&'static PlanDef> {
    PLANS_V1.iter().find(|p| p.id == plan_id)
}

// Only the free tier is constrained; any plan id outside the table behaves as paid.
pub fn daily_limit_for(plan_id: &str) -> i64 {
    match plan_def(plan_id) {
        Some(def) => def.daily_limit,
        None if plan_id == FREE_PLAN_ID => FREE_DAILY_LIMIT,
        None => -1,
    }
}

pub fn timestamp_allowed_for(plan_id: &str) -> bool {
    plan_id != FREE_PLAN_ID
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entitlement {
    pub authenticated: bool,
    pub plan: String,
    pub today_count: u32,
    pub daily_limit: i64,
    pub can_process: bool,
    pub can_use_timestamp: bool,
}

impl Entitlement {
    pub fn evaluate(plan_id: &str, today_count: u32) -> Self {
        let daily_limit = daily_limit_for(plan_id);
        Self {
            authenticated: true,
            plan: plan_id.to_string(),
            today_count,
            daily_limit,
            can_process: daily_limit < 0 || (today_count as i64) < daily_limit,
            can_use_timestamp: timestamp_allowed_for(plan_id),
        }
    }

    // Anonymous sessions may process locally but never get the timestamp label.
    pub fn unauthenticated() -> Self {
        Self {
            authenticated: false,
            plan: FREE_PLAN_ID.to_string(),
            today_count: 0,
            daily_limit: FREE_DAILY_LIMIT,
            can_process: true,
            can_use_timestamp: false,
        }
    }

    // None means unlimited.
    pub fn remaining(&self) -> Option<u32> {
        if self.daily_limit < 0 {
            None
        } else {
            Some((self.daily_limit - self.today_count as i64).max(0) as u32)
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("authenticated".to_string(), Value::Bool(self.authenticated));
        map.insert("plan".to_string(), Value::String(self.plan.clone()));
        map.insert("todayCount".to_string(), Value::from(self.today_count));
        map.insert("dailyLimit".to_string(), Value::from(self.daily_limit));
        map.insert("canProcess".to_string(), Value::Bool(self.can_process));
        map.insert(
            "canUseTimestamp".to_string(),
            Value::Bool(self.can_use_timestamp),
        );
        Value::Object(map)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        Some(Self {
            authenticated: value.get("authenticated").and_then(Value::as_bool)?,
            plan: value.get("plan").and_then(Value::as_str)?.to_string(),
            today_count: value.get("todayCount").and_then(Value::as_u64)? as u32,
            daily_limit: value.get("dailyLimit").and_then(Value::as_i64)?,
            can_process: value.get("canProcess").and_then(Value::as_bool)?,
            can_use_timestamp: value.get("canUseTimestamp").and_then(Value::as_bool)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportAction {
    Sign,
    Fill,
    Compress,
    Convert,
}

impl ExportAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportAction::Sign => "sign",
            ExportAction::Fill => "fill",
            ExportAction::Compress => "compress",
            ExportAction::Convert => "convert",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "sign" => Some(ExportAction::Sign),
            "fill" => Some(ExportAction::Fill),
            "compress" => Some(ExportAction::Compress),
            "convert" => Some(ExportAction::Convert),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportRecord {
    pub filename: String,
    pub original_name: String,
    pub kind: String,
    pub action: ExportAction,
    pub size_bytes: u64,
    pub sha256: String,
}

impl ExportRecord {
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("filename".to_string(), Value::String(self.filename.clone()));
        map.insert(
            "originalName".to_string(),
            Value::String(self.original_name.clone()),
        );
        map.insert("type".to_string(), Value::String(self.kind.clone()));
        map.insert(
            "action".to_string(),
            Value::String(self.action.as_str().to_string()),
        );
        map.insert("size".to_string(), Value::from(self.size_bytes));
        map.insert("sha256".to_string(), Value::String(self.sha256.clone()));
        Value::Object(map)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        Some(Self {
            filename: value.get("filename").and_then(Value::as_str)?.to_string(),
            original_name: value
                .get("originalName")
                .and_then(Value::as_str)?
                .to_string(),
            kind: value.get("type").and_then(Value::as_str)?.to_string(),
            action: value
                .get("action")
                .and_then(Value::as_str)
                .and_then(ExportAction::from_str)?,
            size_bytes: value.get("size").and_then(Value::as_u64).unwrap_or(0),
            sha256: value
                .get("sha256")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded { today_count: u32 },
    LimitReached,
}

impl RecordOutcome {
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        match self {
            RecordOutcome::Recorded { today_count } => {
                map.insert("todayCount".to_string(), Value::from(*today_count));
            }
            RecordOutcome::LimitReached => {
                map.insert("limitReached".to_string(), Value::Bool(true));
            }
        }
        Value::Object(map)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        if value
            .get("limitReached")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Some(RecordOutcome::LimitReached);
        }
        value
            .get("todayCount")
            .and_then(Value::as_u64)
            .map(|count| RecordOutcome::Recorded {
                today_count: count as u32,
            })
    }
}

// Saved signature payload as persisted by the boundary; `data` is a data-URI image.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedSignature {
    pub id: String,
    pub name: String,
    pub data: String,
    pub created_at: String,
}

impl SavedSignature {
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        map.insert("name".to_string(), Value::String(self.name.clone()));
        map.insert("data".to_string(), Value::String(self.data.clone()));
        map.insert(
            "createdAt".to_string(),
            Value::String(self.created_at.clone()),
        );
        Value::Object(map)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        Some(Self {
            id: value.get("id").and_then(Value::as_str)?.to_string(),
            name: value.get("name").and_then(Value::as_str)?.to_string(),
            data: value.get("data").and_then(Value::as_str)?.to_string(),
            created_at: value
                .get("createdAt")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct BoundaryContractMetadata {
    pub contract_id: &'static str,
    pub contract_version: &'static str,
    pub contract_fingerprint_sha256: String,
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

static CONTRACT_FINGERPRINT: OnceLock<String> = OnceLock::new();

pub fn contract_fingerprint_sha256() -> String {
    CONTRACT_FINGERPRINT
        .get_or_init(|| {
            let mut text = String::new();
            text.push_str(CONTRACT_ID);
            text.push('\n');
            text.push_str(CONTRACT_VERSION);
            text.push('\n');
            for plan in &PLANS_V1 {
                text.push_str(plan.id);
                text.push('\n');
                text.push_str(plan.name);
                text.push('\n');
                text.push_str(&plan.daily_limit.to_string());
                text.push('\n');
                text.push_str(if plan.timestamped_signature { "1" } else { "0" });
                text.push('\n');
            }
            hex_sha256(text.as_bytes())
        })
        .clone()
}

pub fn metadata() -> BoundaryContractMetadata {
    BoundaryContractMetadata {
        contract_id: CONTRACT_ID,
        contract_version: CONTRACT_VERSION,
        contract_fingerprint_sha256: contract_fingerprint_sha256(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_fingerprint_is_stable_and_nonempty() {
        let a = contract_fingerprint_sha256();
        let b = contract_fingerprint_sha256();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn plan_table_only_constrains_free_tier() {
        let free = plan_def("free").unwrap();
        assert_eq!(free.daily_limit, 2);
        assert!(!free.timestamped_signature);
        for plan in plan_defs_v1().iter().filter(|p| p.id != "free") {
            assert_eq!(plan.daily_limit, -1, "paid plan {} must be unlimited", plan.id);
            assert!(plan.timestamped_signature);
        }
        assert!(plan_def("enterprise").is_none());
        assert_eq!(daily_limit_for("enterprise"), -1);
    }

    #[test]
    fn entitlement_evaluation_matches_plan_rules() {
        let free_fresh = Entitlement::evaluate("free", 0);
        assert!(free_fresh.can_process);
        assert!(!free_fresh.can_use_timestamp);
        assert_eq!(free_fresh.remaining(), Some(2));

        let free_spent = Entitlement::evaluate("free", 2);
        assert!(!free_spent.can_process);
        assert_eq!(free_spent.remaining(), Some(0));

        let pro = Entitlement::evaluate("pro", 1000);
        assert!(pro.can_process);
        assert!(pro.can_use_timestamp);
        assert_eq!(pro.remaining(), None);
    }

    #[test]
    fn unauthenticated_entitlement_allows_processing_without_timestamp() {
        let anon = Entitlement::unauthenticated();
        assert!(!anon.authenticated);
        assert_eq!(anon.plan, "free");
        assert!(anon.can_process);
        assert!(!anon.can_use_timestamp);
    }

    #[test]
    fn entitlement_wire_round_trip() {
        let original = Entitlement::evaluate("pro", 7);
        let value = original.to_value();
        assert_eq!(value.get("dailyLimit").and_then(Value::as_i64), Some(-1));
        let parsed = Entitlement::from_value(&value).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn export_record_uses_boundary_key_names() {
        let record = ExportRecord {
            filename: "contrat_signe.pdf".to_string(),
            original_name: "contrat.pdf".to_string(),
            kind: EXPORT_KIND_PDF.to_string(),
            action: ExportAction::Sign,
            size_bytes: 48_213,
            sha256: "ab".repeat(32),
        };
        let value = record.to_value();
        assert_eq!(
            value.get("originalName").and_then(Value::as_str),
            Some("contrat.pdf")
        );
        assert_eq!(value.get("type").and_then(Value::as_str), Some("pdf"));
        assert_eq!(value.get("action").and_then(Value::as_str), Some("sign"));
        assert_eq!(value.get("size").and_then(Value::as_u64), Some(48_213));
        let parsed = ExportRecord::from_value(&value).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn export_record_size_defaults_to_zero() {
        let value: Value = serde_json::from_str(
            r#"{"filename":"a_compressé.pdf","originalName":"a.pdf","type":"pdf","action":"compress"}"#,
        )
        .unwrap();
        let parsed = ExportRecord::from_value(&value).unwrap();
        assert_eq!(parsed.size_bytes, 0);
        assert!(parsed.sha256.is_empty());
    }

    #[test]
    fn record_outcome_distinguishes_limit_responses() {
        let hit: Value = serde_json::from_str(r#"{"error":"Limite atteinte","limitReached":true}"#).unwrap();
        assert_eq!(RecordOutcome::from_value(&hit), Some(RecordOutcome::LimitReached));

        let ok: Value = serde_json::from_str(r#"{"todayCount":2}"#).unwrap();
        assert_eq!(
            RecordOutcome::from_value(&ok),
            Some(RecordOutcome::Recorded { today_count: 2 })
        );
    }

    #[test]
    fn saved_signature_wire_round_trip() {
        let sig = SavedSignature {
            id: "sig_01".to_string(),
            name: "Paraphe".to_string(),
            data: "data:image/png;base64,iVBORw0KGgo=".to_string(),
            created_at: "2025-03-14T09:26:53.000Z".to_string(),
        };
        let parsed = SavedSignature::from_value(&sig.to_value()).unwrap();
        assert_eq!(parsed, sig);
    }
}
