//! Deterministic, human-readable peer nicknames.
//!
//! A nickname is derived from the SHA-256 digest of the peer id: the first two digest bytes pick
//! two adjectives and the third byte picks an animal. Distinct ids may collide on the same name,
//! and names differ from the ones MD5-based tools derive for the same id.

use std::{collections::HashMap, sync::RwLock};

use once_cell::sync::Lazy;

use crate::hash::ContentHash;

pub const ADJECTIVES: [&str; 245] = [
    "agile", "alert", "amphibious", "aquatic", "arctic", "armored", "barky", "beaked",
    "bellowing", "bipedal", "bold", "bristly", "burrowing", "camouflaged", "carnivorous",
    "chattering", "clawed", "climbing", "coiled", "colorful", "crested", "cunning", "curious",
    "dappled", "darting", "deadly", "deft", "dense", "dextrous", "diving", "docile", "domestic",
    "dormant", "downy", "durable", "eager", "elusive", "endangered", "energetic", "enormous",
    "exotic", "extinct", "fanged", "fast", "feathered", "feline", "ferocious", "fierce",
    "finicky", "fishy", "flapping", "fleecy", "flexible", "flightless", "fluffy", "foraging",
    "foxy", "freckled", "frisky", "furry", "galloping", "gentle", "giant", "gilded", "gliding",
    "graceful", "grassy", "grazing", "gregarious", "grunting", "hairy", "hardy", "hibernating",
    "hoarse", "horned", "howling", "huge", "hulking", "humming", "hunting", "insectivorous",
    "invisible", "iridescent", "jagged", "jumping", "keen", "knobby", "lanky", "large", "lazy",
    "leaping", "leggy", "lethal", "lightfooted", "lithe", "lively", "long", "loud", "lumbering",
    "majestic", "mammalian", "mangy", "marine", "masked", "meek", "melodic", "mighty", "mimic",
    "miniature", "moist", "monstrous", "mottled", "muscular", "mute", "nasty", "nimble",
    "nocturnal", "noisy", "omnivorous", "opaque", "padded", "pale", "patterned", "pawing",
    "peaceful", "peckish", "pensive", "pesty", "placid", "playful", "plump", "poisonous",
    "polished", "pouncing", "powerful", "prehistoric", "prickly", "prowling", "pudgy",
    "purring", "quick", "quiet", "rabid", "raging", "rangy", "rapid", "ravenous", "reclusive",
    "regal", "reptilian", "restless", "roaring", "robust", "rough", "rugged", "running",
    "savage", "scaly", "scampering", "scavenging", "scented", "screeching", "scruffy",
    "scurrying", "secretive", "sedate", "shaggy", "sharp", "shiny", "short", "shrewd", "shy",
    "silent", "silky", "singing", "sizable", "skilled", "skittish", "sleek", "slender", "slimy",
    "slithering", "slow", "sly", "small", "smooth", "snappy", "sneaky", "sniffing", "snorting",
    "soaring", "soft", "solitary", "spotted", "sprightly", "squeaky", "squinting", "stalking",
    "stealthy", "stinging", "stinky", "stocky", "striped", "strong", "stubby", "sturdy",
    "subtle", "swift", "tall", "tame", "tangled", "tawny", "tenacious", "territorial", "thick",
    "thorny", "thriving", "timid", "tiny", "toothy", "tough", "tricky", "tropical", "trotting",
    "twitchy", "unseen", "untamed", "vicious", "vigilant", "vocal", "voracious", "waddling",
    "wary", "webbed", "whiskered", "whistling", "wild", "wily", "winged", "wiry", "wise",
    "woolly", "yapping", "yawning", "zealous"
];

pub const ANIMALS: [&str; 220] = [
    "aardvark", "albatross", "alligator", "alpaca", "anaconda", "ant", "anteater", "antelope",
    "ape", "armadillo", "baboon", "badger", "barracuda", "bat", "bear", "beaver", "bee",
    "bison", "boar", "bobcat", "buffalo", "butterfly", "camel", "capybara", "caribou",
    "cassowary", "cat", "caterpillar", "cheetah", "chicken", "chimpanzee", "chinchilla", "clam",
    "cobra", "cockroach", "cod", "condor", "coral", "cougar", "cow", "coyote", "crab", "crane",
    "crocodile", "crow", "deer", "dingo", "dinosaur", "dog", "dolphin", "donkey", "dove",
    "dragonfly", "duck", "eagle", "eel", "elephant", "elk", "emu", "falcon", "ferret", "finch",
    "fish", "flamingo", "flea", "fly", "fox", "frog", "gazelle", "gecko", "gerbil", "gibbon",
    "giraffe", "goat", "goose", "gorilla", "grasshopper", "grouse", "gull", "hamster", "hare",
    "hawk", "hedgehog", "heron", "hippo", "hornet", "horse", "hummingbird", "hyena", "ibis",
    "iguana", "impala", "jackal", "jaguar", "jay", "jellyfish", "kangaroo", "kingfisher",
    "kiwi", "koala", "komodo", "ladybug", "lemur", "leopard", "lion", "lizard", "llama",
    "lobster", "locust", "lynx", "macaque", "macaw", "magpie", "mallard", "mammoth", "manatee",
    "mandrill", "mantis", "marmot", "meerkat", "mink", "mole", "mongoose", "monkey", "moose",
    "mosquito", "mouse", "mule", "narwhal", "newt", "nightingale", "octopus", "okapi",
    "opossum", "orangutan", "ostrich", "otter", "owl", "ox", "panda", "panther", "parrot",
    "peacock", "pelican", "penguin", "pheasant", "pig", "pigeon", "piranha", "platypus",
    "porcupine", "porpoise", "prairie dog", "prawn", "puffin", "puma", "python", "quail",
    "rabbit", "raccoon", "ram", "rat", "raven", "reindeer", "rhino", "robin", "rooster",
    "salamander", "salmon", "sandpiper", "sardine", "scorpion", "seahorse", "seagull", "seal",
    "sealion", "shark", "sheep", "shrew", "shrimp", "skunk", "sloth", "slug", "snail", "snake",
    "sparrow", "spider", "squid", "squirrel", "starfish", "stingray", "stork", "swan",
    "tamarin", "tapir", "tarantula", "termite", "tiger", "toad", "tortoise", "toucan", "trout",
    "tuna", "turkey", "turtle", "viper", "vulture", "wallaby", "walrus", "warthog", "wasp",
    "weasel", "whale", "wildebeest", "wolf", "wombat", "woodpecker", "worm", "yak", "zebra"
];

static NAME_CACHE: Lazy<NameCache> = Lazy::new(NameCache::default);

/// Returns the nickname of a peer, e.g. `"alert deft bee"`.
///
/// If `no_spaces` is set, the words are joined with `_` instead.
pub fn nickname(peer_id: &str, no_spaces: bool) -> String {
    let name = NAME_CACHE.get(peer_id);
    if no_spaces {
        name.replace(' ', "_")
    } else {
        name
    }
}

/// Returns the first id in `peer_ids` whose nickname equals `name`.
///
/// Spaces and underscores are treated as equivalent separators.
pub fn search_peer_ids_for_name<'a, I>(peer_ids: I, name: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let wanted = name.trim().replace('_', " ");
    peer_ids
        .into_iter()
        .find(|peer_id| NAME_CACHE.get(peer_id) == wanted)
}

fn derive_name(peer_id: &str) -> String {
    let digest = ContentHash::digest(peer_id);
    let bytes = digest.as_bytes();
    format!(
        "{} {} {}",
        ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()],
        ADJECTIVES[bytes[1] as usize % ADJECTIVES.len()],
        ANIMALS[bytes[2] as usize % ANIMALS.len()],
    )
}

/// A memo of already derived nicknames.
#[derive(Debug, Default)]
pub struct NameCache {
    names: RwLock<HashMap<String, String>>,
}

impl NameCache {
    /// Returns the memoized nickname of `peer_id`, deriving it on first use.
    pub fn get(&self, peer_id: &str) -> String {
        if let Ok(names) = self.names.read() {
            if let Some(name) = names.get(peer_id) {
                return name.clone();
            }
        }
        let name = derive_name(peer_id);
        if let Ok(mut names) = self.names.write() {
            names.insert(peer_id.to_string(), name.clone());
        }
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER_IDS: [&str; 3] = [
        "QmYyQSo1c1Ym7orWxLYvCrM2EmxFTANf8wXmmE7DWjhx5N",
        "Qma9T5YraSnpRDZqRR4krcSJabThc8nwZuJV3LercPHufi",
        "Qmb8wVVVMTRmG4U1tCdaCCqietuWwpGRSbL53PA5azBViP",
    ];

    #[test]
    fn test_nickname() {
        let names: Vec<String> = PEER_IDS.iter().map(|id| nickname(id, false)).collect();
        assert_eq!(
            names,
            vec!["alert deft bee", "savage gregarious otter", "clawed strong weasel"]
        );
        assert_eq!(nickname(PEER_IDS[2], true), "clawed_strong_weasel");
    }

    #[test]
    fn test_nickname_is_stable() {
        let cache = NameCache::default();
        assert_eq!(cache.get(PEER_IDS[0]), cache.get(PEER_IDS[0]));
        assert_eq!(cache.get(PEER_IDS[0]), derive_name(PEER_IDS[0]));
    }

    #[test]
    fn test_search_peer_ids_for_name() {
        let results: Vec<Option<&str>> = ["none", "not an animal", "clawed strong weasel"]
            .iter()
            .map(|name| search_peer_ids_for_name(PEER_IDS.iter().copied(), name))
            .collect();
        assert_eq!(results, vec![None, None, Some(PEER_IDS[2])]);
        assert_eq!(
            search_peer_ids_for_name(PEER_IDS.iter().copied(), "savage_gregarious_otter"),
            Some(PEER_IDS[1])
        );
    }

    #[test]
    fn test_word_lists_have_no_duplicates() {
        let mut adjectives = ADJECTIVES.to_vec();
        adjectives.sort_unstable();
        adjectives.dedup();
        assert_eq!(adjectives.len(), ADJECTIVES.len());

        let mut animals = ANIMALS.to_vec();
        animals.sort_unstable();
        animals.dedup();
        assert_eq!(animals.len(), ANIMALS.len());
    }
}
