use waddle_core::types::ProviderKind;

/// Inputs to post-call accounting for one accepted request.
///
/// Raw token counts are optional: when the upstream reported usage those
/// counts are authoritative, otherwise the accountant estimates from the
/// request/response text.
#[derive(Debug)]
pub struct UsageParams<'a> {
    pub credential_id: &'a str,
    pub principal_id: &'a str,
    pub tenant_id: &'a str,
    pub kind: ProviderKind,
    pub model: &'a str,
    pub link_id: Option<&'a str>,
    pub raw_input_tokens: Option<u64>,
    pub raw_output_tokens: Option<u64>,
    pub input_text: &'a str,
    pub output_text: &'a str,
    pub success: bool,
}

/// What accounting resolved and persisted.
#[derive(Debug, Clone, Copy)]
pub struct AccountedUsage {
    pub normalized_tokens: u64,
    pub raw_input_tokens: u64,
    pub raw_output_tokens: u64,
    pub cost_estimate: f64,
}
