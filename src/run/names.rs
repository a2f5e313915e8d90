//! Run identity generation.

use rand::seq::SliceRandom;
use uuid::Uuid;

const ID_PREFIX: &str = "run_";
const ID_HEX_LEN: usize = 12;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brave", "brisk", "calm", "clever", "crisp", "daring", "deft", "eager",
    "fleet", "fond", "gentle", "glad", "keen", "late", "lively", "lucid", "mellow", "merry",
    "misty", "nimble", "noble", "pale", "plucky", "proud", "quiet", "rapid", "rustic", "sly",
    "solid", "spry", "steady", "stout", "swift", "tidy", "vivid", "warm", "wise", "witty",
];

const NOUNS: &[&str] = &[
    "aspen", "badger", "bison", "cedar", "comet", "condor", "coral", "crane", "delta", "dune",
    "falcon", "fern", "finch", "fjord", "gecko", "glacier", "harbor", "heron", "ibex", "jay",
    "kestrel", "lagoon", "lark", "lemur", "lynx", "maple", "marmot", "meadow", "otter", "owl",
    "petrel", "pine", "raven", "reef", "ridge", "sparrow", "spruce", "tern", "vole", "wren",
];

/// Generate a run id: `run_` plus twelve lowercase hex characters.
pub fn generate_run_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}{}", ID_PREFIX, &hex[..ID_HEX_LEN])
}

/// Draw a random two-word name like `quiet-otter`.
pub fn random_name() -> String {
    let mut rng = rand::thread_rng();
    // Both word lists are non-empty constants.
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("otter");
    format!("{}-{}", adjective, noun)
}
