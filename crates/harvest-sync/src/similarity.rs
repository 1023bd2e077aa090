use strsim::normalized_levenshtein;

/// Lowercased, whitespace runs collapsed to one space, trimmed.
pub fn normalize_address(input: &str) -> String {
    input
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Address similarity in `[0, 1]`; 1.0 for addresses equal after normalization.
pub fn address_similarity(a: &str, b: &str) -> f64 {
    normalized_levenshtein(&normalize_address(a), &normalize_address(b))
}
