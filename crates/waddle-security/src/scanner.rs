use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::db::{count_events_since, insert_event};
use crate::patterns::PATTERN_FAMILIES;
use crate::policy::ScanPolicy;
use crate::types::{SecurityAction, Severity, ThreatDetection, ThreatKind};

/// Stored prompt samples are truncated to this many bytes.
const PROMPT_SAMPLE_LEN: usize = 1000;
/// Matched spans kept per detection.
const MATCH_SAMPLE_COUNT: usize = 5;
/// Rolling window for the repeat-offender check.
const RATE_WINDOW_SECS: i64 = 3600;

/// Who issued the prompt being scanned. Every field is optional: the
/// scanner also runs for unauthenticated probes we still want logged.
#[derive(Debug, Default, Clone)]
pub struct ScanActor<'a> {
    pub principal_id: Option<&'a str>,
    pub credential_id: Option<&'a str>,
    pub tenant_id: Option<&'a str>,
    pub source_ip: Option<&'a str>,
}

/// Pattern-based prompt scanner driven by a named policy.
pub struct SecurityScanner {
    db: Arc<Mutex<Connection>>,
    policy: ScanPolicy,
}

impl SecurityScanner {
    pub fn new(db: Arc<Mutex<Connection>>, policy_name: &str) -> Self {
        Self {
            db,
            policy: ScanPolicy::named(policy_name),
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name
    }

    /// Scan a prompt. Returns the detected threats and the working text
    /// with every sanitize-action match replaced by its placeholder.
    ///
    /// Every detection is logged to security_events; `blocked` is set iff
    /// the policy action for that kind is Block.
    pub fn scan(&self, prompt: &str, actor: &ScanActor<'_>) -> (Vec<ThreatDetection>, String) {
        // Over-length prompts get a single medium-severity blocking threat
        // and no pattern pass; scanning megabytes of text is itself a DoS.
        if prompt.len() > self.policy.max_prompt_length {
            let threat = ThreatDetection {
                kind: ThreatKind::InstructionOverride,
                severity: Severity::Medium,
                confidence: 1.0,
                matched: vec!["prompt_too_long".to_string()],
                description: format!(
                    "Prompt exceeds maximum length of {} characters",
                    self.policy.max_prompt_length
                ),
                action: SecurityAction::Block,
            };
            self.log_threats(std::slice::from_ref(&threat), prompt, actor);
            return (vec![threat], prompt.to_string());
        }

        let mut detected = Vec::new();
        let mut sanitized = prompt.to_string();

        for family in PATTERN_FAMILIES.iter() {
            let mut matched: Vec<String> = Vec::new();
            for pattern in &family.patterns {
                for m in pattern.find_iter(prompt) {
                    matched.push(m.as_str().to_string());
                }
            }
            if matched.len() < self.policy.min_matches(family.kind) {
                continue;
            }

            let confidence = (matched.len() as f64 / 5.0).min(1.0);
            let severity = if matched.len() >= 5 {
                family.kind.base_severity().escalate()
            } else {
                family.kind.base_severity()
            };
            let action = self.policy.action(family.kind);

            if action == SecurityAction::Sanitize {
                sanitized = crate::patterns::sanitize_text(family.kind, &sanitized);
            }

            let match_count = matched.len();
            matched.truncate(MATCH_SAMPLE_COUNT);
            detected.push(ThreatDetection {
                kind: family.kind,
                severity,
                confidence,
                matched,
                description: format!(
                    "Detected {} patterns: {} matches",
                    family.kind, match_count
                ),
                action,
            });
        }

        self.log_threats(&detected, prompt, actor);
        (detected, sanitized)
    }

    /// Whether this actor is still under the policy's rolling threat
    /// budget. All provided identifiers are intersected.
    pub fn check_rate_limit(&self, actor: &ScanActor<'_>) -> bool {
        if actor.principal_id.is_none()
            && actor.credential_id.is_none()
            && actor.source_ip.is_none()
        {
            return true;
        }
        let since = (Utc::now() - chrono::Duration::seconds(RATE_WINDOW_SECS)).to_rfc3339();
        let conn = self.db.lock().unwrap();
        match count_events_since(
            &conn,
            &since,
            actor.principal_id,
            actor.credential_id,
            actor.source_ip,
        ) {
            Ok(count) => count < self.policy.rate_limit_threshold,
            Err(e) => {
                warn!(err = %e, "rate limit count failed; allowing request");
                true
            }
        }
    }

    fn log_threats(&self, threats: &[ThreatDetection], prompt: &str, actor: &ScanActor<'_>) {
        if threats.is_empty() {
            return;
        }
        let now = Utc::now();
        let fingerprint = fingerprint(prompt, now.timestamp_micros());
        let sample: String = prompt.chars().take(PROMPT_SAMPLE_LEN).collect();

        let conn = self.db.lock().unwrap();
        for threat in threats {
            let blocked = threat.action == SecurityAction::Block;
            if let Err(e) = insert_event(
                &conn,
                &now.to_rfc3339(),
                actor.principal_id,
                actor.credential_id,
                actor.tenant_id,
                &fingerprint,
                threat,
                blocked,
                &sample,
                self.policy.name,
                actor.source_ip,
            ) {
                warn!(err = %e, kind = %threat.kind, "failed to log security event");
            }
            warn!(
                kind = %threat.kind,
                severity = %threat.severity,
                confidence = threat.confidence,
                blocked,
                principal = actor.principal_id.unwrap_or("-"),
                "security threat detected"
            );
        }
    }
}

fn fingerprint(prompt: &str, stamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(stamp.to_le_bytes());
    hex::encode(hasher.finalize())
}
