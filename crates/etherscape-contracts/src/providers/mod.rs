pub const GEMINI: &str = "gemini";
pub const FAL: &str = "fal";
pub const STABILITY: &str = "stability";
pub const REPLICATE: &str = "replicate";
pub const LEONARDO: &str = "leonardo";
pub const BFL: &str = "bfl";
pub const CLIPDROP: &str = "clipdrop";
pub const DRYRUN: &str = "dryrun";

/// Order in which providers are tried when the selected one cannot serve a
/// request. `dryrun` only runs when selected.
pub const DEFAULT_FALLBACK_ORDER: &[&str] = &[GEMINI, FAL, STABILITY, LEONARDO, REPLICATE, BFL, CLIPDROP];

pub fn default_fallback_order() -> Vec<String> {
    DEFAULT_FALLBACK_ORDER
        .iter()
        .map(|id| (*id).to_string())
        .collect()
}

/// Rotates `order` so the walk starts at `selected` and wraps around.
///
/// A selected provider that is missing from `order` is tried first and then
/// the full order follows.
pub fn fallback_sequence(order: &[String], selected: &str) -> Vec<String> {
    let selected = selected.trim();
    match order.iter().position(|id| id == selected) {
        Some(start) => order[start..]
            .iter()
            .chain(order[..start].iter())
            .cloned()
            .collect(),
        None => {
            let mut sequence = Vec::with_capacity(order.len() + 1);
            if !selected.is_empty() {
                sequence.push(selected.to_string());
            }
            sequence.extend(order.iter().cloned());
            sequence
        }
    }
}
