//! Human-readable session identifiers: adjective-animal-number, e.g.
//! "golden-eagle-427". Readable enough to dictate over the air, random enough
//! that collisions are settled by the store's create-iff-absent write.

use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brave", "bright", "calm", "clever", "copper", "crimson",
    "eager", "gentle", "golden", "jade", "keen", "lively", "lunar", "mellow",
    "noble", "quiet", "rapid", "silver", "solar", "swift", "vivid", "wise",
];

const ANIMALS: &[&str] = &[
    "badger", "bison", "condor", "crane", "dolphin", "eagle", "falcon", "fox",
    "heron", "ibis", "jaguar", "lynx", "marmot", "otter", "owl", "panther",
    "puffin", "raven", "salmon", "sparrow", "tiger", "walrus", "wolf", "wren",
];

/// Generate a fresh three-part session slug.
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{}-{}-{}",
        ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())],
        ANIMALS[rng.gen_range(0..ANIMALS.len())],
        rng.gen_range(0..1000)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_have_three_parts() {
        let slug = generate();
        let parts: Vec<&str> = slug.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert!(ADJECTIVES.contains(&parts[0]));
        assert!(ANIMALS.contains(&parts[1]));
        assert!(parts[2].parse::<u16>().unwrap() < 1000);
    }
}
