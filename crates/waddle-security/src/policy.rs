//! The three named scan policies. A policy fixes the prompt length cap,
//! the per-kind minimum match counts, the per-kind response action, and
//! the repeat-offender threshold used by the rolling rate-limit check.

use crate::types::{SecurityAction, ThreatKind};

#[derive(Debug, Clone)]
pub struct ScanPolicy {
    pub name: &'static str,
    pub max_prompt_length: usize,
    /// Detections below a kind's minimum match count are discarded.
    min_matches: [(ThreatKind, usize); 5],
    actions: [(ThreatKind, SecurityAction); 5],
    /// Threat events per principal/credential/IP tolerated per rolling hour.
    pub rate_limit_threshold: u32,
}

impl ScanPolicy {
    pub fn min_matches(&self, kind: ThreatKind) -> usize {
        self.min_matches
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, n)| *n)
            .unwrap_or(1)
    }

    pub fn action(&self, kind: ThreatKind) -> SecurityAction {
        self.actions
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, a)| *a)
            .unwrap_or(SecurityAction::Log)
    }

    /// Resolve a policy by name. Unknown names fall back to balanced so a
    /// typo in config degrades safely instead of disabling scanning.
    pub fn named(name: &str) -> ScanPolicy {
        match name {
            "strict" => STRICT.clone(),
            "permissive" => PERMISSIVE.clone(),
            "balanced" => BALANCED.clone(),
            other => {
                tracing::warn!(policy = other, "unknown security policy, using balanced");
                BALANCED.clone()
            }
        }
    }
}

const STRICT: ScanPolicy = ScanPolicy {
    name: "strict",
    max_prompt_length: 10_000,
    min_matches: [
        (ThreatKind::InstructionOverride, 1),
        (ThreatKind::Jailbreak, 1),
        (ThreatKind::Exfiltration, 1),
        (ThreatKind::PromptFormatLeak, 1),
        (ThreatKind::CredentialLeak, 1),
    ],
    actions: [
        (ThreatKind::InstructionOverride, SecurityAction::Block),
        (ThreatKind::Jailbreak, SecurityAction::Block),
        (ThreatKind::Exfiltration, SecurityAction::Block),
        (ThreatKind::PromptFormatLeak, SecurityAction::Block),
        (ThreatKind::CredentialLeak, SecurityAction::Block),
    ],
    rate_limit_threshold: 10,
};

// Exfiltration needs two corroborating matches under balanced: a lone
// "what are your instructions" inside otherwise-benign text is the most
// common false positive in real traffic.
const BALANCED: ScanPolicy = ScanPolicy {
    name: "balanced",
    max_prompt_length: 50_000,
    min_matches: [
        (ThreatKind::InstructionOverride, 1),
        (ThreatKind::Jailbreak, 1),
        (ThreatKind::Exfiltration, 2),
        (ThreatKind::PromptFormatLeak, 1),
        (ThreatKind::CredentialLeak, 1),
    ],
    actions: [
        (ThreatKind::InstructionOverride, SecurityAction::Block),
        (ThreatKind::Jailbreak, SecurityAction::Sanitize),
        (ThreatKind::Exfiltration, SecurityAction::Block),
        (ThreatKind::PromptFormatLeak, SecurityAction::Sanitize),
        (ThreatKind::CredentialLeak, SecurityAction::Block),
    ],
    rate_limit_threshold: 20,
};

const PERMISSIVE: ScanPolicy = ScanPolicy {
    name: "permissive",
    max_prompt_length: 100_000,
    min_matches: [
        (ThreatKind::InstructionOverride, 2),
        (ThreatKind::Jailbreak, 3),
        (ThreatKind::Exfiltration, 2),
        (ThreatKind::PromptFormatLeak, 2),
        (ThreatKind::CredentialLeak, 1),
    ],
    actions: [
        (ThreatKind::InstructionOverride, SecurityAction::Sanitize),
        (ThreatKind::Jailbreak, SecurityAction::Log),
        (ThreatKind::Exfiltration, SecurityAction::Sanitize),
        (ThreatKind::PromptFormatLeak, SecurityAction::Log),
        (ThreatKind::CredentialLeak, SecurityAction::Block),
    ],
    rate_limit_threshold: 50,
};
