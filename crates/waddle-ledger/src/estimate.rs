//! Local token estimation for admission pre-checks and for backends that
//! do not report usage. Deliberately crude: roughly four characters per
//! token across the model families we route to. Authoritative upstream
//! counts always take precedence (see `TokenAccountant::record_usage`).

/// `ceil(chars / 4)`, never negative, zero only for empty text.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4)
}

/// Estimate over a set of message bodies.
pub fn estimate_messages<'a, I>(contents: I) -> u64
where
    I: IntoIterator<Item = &'a str>,
{
    contents.into_iter().map(estimate_tokens).sum()
}
