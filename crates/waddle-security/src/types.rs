use serde::{Deserialize, Serialize};
use std::fmt;

/// The five threat families the scanner recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatKind {
    /// "ignore/forget/disregard prior instructions", new-system directives.
    InstructionOverride,
    /// "pretend you are", "bypass your guidelines", hypothetical framing.
    Jailbreak,
    /// "reveal your system prompt", "print your instructions".
    Exfiltration,
    /// Chat-template role tokens appearing inside user content.
    PromptFormatLeak,
    /// High-entropy substrings shaped like API keys and passwords.
    CredentialLeak,
}

impl ThreatKind {
    pub const ALL: [ThreatKind; 5] = [
        ThreatKind::InstructionOverride,
        ThreatKind::Jailbreak,
        ThreatKind::Exfiltration,
        ThreatKind::PromptFormatLeak,
        ThreatKind::CredentialLeak,
    ];

    /// Severity before match-count escalation.
    pub fn base_severity(&self) -> Severity {
        match self {
            ThreatKind::InstructionOverride => Severity::High,
            ThreatKind::Jailbreak => Severity::Medium,
            ThreatKind::Exfiltration => Severity::High,
            ThreatKind::PromptFormatLeak => Severity::Critical,
            ThreatKind::CredentialLeak => Severity::Critical,
        }
    }

    /// Text substituted for each matched span when the action is sanitize.
    pub fn redaction_placeholder(&self) -> &'static str {
        match self {
            ThreatKind::InstructionOverride => "[REDACTED: Instruction override attempt]",
            ThreatKind::Jailbreak => "[REDACTED: Roleplay attempt]",
            ThreatKind::Exfiltration => "[REDACTED: System information request]",
            ThreatKind::PromptFormatLeak => "[REDACTED: System token]",
            ThreatKind::CredentialLeak => "[REDACTED: Credential]",
        }
    }
}

impl fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreatKind::InstructionOverride => write!(f, "instruction_override"),
            ThreatKind::Jailbreak => write!(f, "jailbreak"),
            ThreatKind::Exfiltration => write!(f, "exfiltration"),
            ThreatKind::PromptFormatLeak => write!(f, "prompt_format_leak"),
            ThreatKind::CredentialLeak => write!(f, "credential_leak"),
        }
    }
}

impl std::str::FromStr for ThreatKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "instruction_override" => Ok(ThreatKind::InstructionOverride),
            "jailbreak" => Ok(ThreatKind::Jailbreak),
            "exfiltration" => Ok(ThreatKind::Exfiltration),
            "prompt_format_leak" => Ok(ThreatKind::PromptFormatLeak),
            "credential_leak" => Ok(ThreatKind::CredentialLeak),
            other => Err(format!("unknown threat kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// One step up, saturating at Critical.
    pub fn escalate(self) -> Severity {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High => Severity::Critical,
            Severity::Critical => Severity::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// What the policy tells the pipeline to do about a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityAction {
    Log,
    Sanitize,
    Block,
}

impl fmt::Display for SecurityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityAction::Log => write!(f, "log"),
            SecurityAction::Sanitize => write!(f, "sanitize"),
            SecurityAction::Block => write!(f, "block"),
        }
    }
}

/// One detected threat, as returned by `SecurityScanner::scan`.
#[derive(Debug, Clone, Serialize)]
pub struct ThreatDetection {
    pub kind: ThreatKind,
    pub severity: Severity,
    /// `min(1, matches / 5)`.
    pub confidence: f64,
    /// First few matched spans, capped for storage.
    pub matched: Vec<String>,
    pub description: String,
    pub action: SecurityAction,
}
