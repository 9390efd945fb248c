//! Word lists for generating human-readable cell names.
//! Format: adjective-noun (e.g., "calm-otter", "brisk-fern")

/// Adjectives for readable name generation.
const ADJECTIVES: &[&str] = &[
    "able", "airy", "amber", "bold", "brave", "brief", "brisk", "calm", "civil", "clear", "cool",
    "cosy", "crisp", "deep", "deft", "dry", "eager", "early", "easy", "even", "fair", "fast",
    "fine", "firm", "fond", "free", "fresh", "glad", "gold", "good", "grand", "green", "hale",
    "handy", "happy", "hardy", "high", "jolly", "keen", "kind", "late", "lean", "light", "lithe",
    "lively", "loyal", "lucid", "mellow", "mild", "neat", "nimble", "noble", "open", "pale",
    "plain", "plucky", "prime", "proud", "quick", "quiet", "rapid", "rare", "ready", "ripe",
    "royal", "sage", "sane", "sharp", "shiny", "sleek", "slim", "smart", "snug", "solid",
    "sound", "spare", "spry", "stark", "still", "stout", "sunny", "swift", "tame", "tidy",
    "trim", "true", "vivid", "warm", "wise", "witty",
];

/// Nouns for readable name generation.
const NOUNS: &[&str] = &[
    "alder", "aspen", "badger", "basin", "beacon", "birch", "bison", "bluff", "brook", "cedar",
    "cliff", "cloud", "comet", "coral", "cove", "crane", "creek", "crest", "delta", "dune",
    "eagle", "ember", "falcon", "fern", "finch", "fjord", "flint", "forge", "fox", "gale",
    "glade", "grove", "gull", "harbor", "hare", "hawk", "heron", "holly", "inlet", "iris",
    "island", "jay", "kestrel", "knoll", "lagoon", "larch", "lark", "ledge", "linden", "lotus",
    "lynx", "maple", "marsh", "meadow", "mesa", "moss", "moth", "newt", "oak", "orchid",
    "osprey", "otter", "owl", "peak", "pebble", "pine", "plume", "pond", "quail", "raven",
    "reef", "ridge", "river", "robin", "rowan", "sable", "shoal", "sparrow", "spruce", "stone",
    "swan", "tarn", "teal", "thicket", "trout", "tundra", "vale", "willow", "wren", "yew",
];

/// Simple string hash (deterministic across runs and platforms).
fn hash_string(s: &str) -> u32 {
    let mut hash: i32 = 0;
    for c in s.chars() {
        let char_code = c as i32;
        hash = ((hash << 5).wrapping_sub(hash)).wrapping_add(char_code);
    }
    hash.unsigned_abs()
}

/// Generate a deterministic human-readable name from a cell ID.
///
/// Same input always produces the same output, so names can be computed
/// rather than stored. Format: adjective-noun (e.g., "calm-otter").
pub fn readable_name_from_cell_id(cell_id: &str) -> String {
    let hash = hash_string(cell_id);
    let adj_idx = (hash as usize) % ADJECTIVES.len();
    let noun_idx = ((hash as usize) / ADJECTIVES.len()) % NOUNS.len();
    format!("{}-{}", ADJECTIVES[adj_idx], NOUNS[noun_idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readable_name_format() {
        let name = readable_name_from_cell_id("cell_test123");
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts.len(), 2, "name should be adjective-noun");
    }

    #[test]
    fn test_readable_name_is_deterministic() {
        let a = readable_name_from_cell_id("cell_abc");
        let b = readable_name_from_cell_id("cell_abc");
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_cells_get_different_names() {
        let a = readable_name_from_cell_id("cell_abc");
        let b = readable_name_from_cell_id("cell_xyz");
        assert_ne!(a, b);
    }
}
