//! Random display names and flight codes.

use rand::Rng;
use rand::seq::SliceRandom;

use airdelivery_protocol::constants::FLIGHT_CODE_LEN;

const NAME_POOL: &[&str] = &[
    "Albatross", "Avocet", "Bittern", "Bluejay", "Bunting", "Condor", "Crane", "Curlew",
    "Dipper", "Dunlin", "Egret", "Falcon", "Finch", "Gannet", "Goshawk", "Grebe", "Heron",
    "Hoopoe", "Ibis", "Jacana", "Kestrel", "Kingfisher", "Kite", "Lapwing", "Lark", "Magpie",
    "Merlin", "Nightjar", "Osprey", "Oriole", "Pelican", "Petrel", "Plover", "Puffin", "Raven",
    "Robin", "Sandpiper", "Skylark", "Sparrow", "Starling", "Swift", "Tern", "Warbler", "Wren",
];

/// Unambiguous code alphabet (no `0/O`, `1/I/L`).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

pub(crate) fn random_name() -> String {
    NAME_POOL
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("Peer")
        .to_owned()
}

/// Generates a code not rejected by `taken`.
pub(crate) fn unique_code(taken: impl Fn(&str) -> bool) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let code: String = (0..FLIGHT_CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        if !taken(&code) {
            return code;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn names_come_from_pool() {
        for _ in 0..20 {
            assert!(NAME_POOL.contains(&random_name().as_str()));
        }
    }

    #[test]
    fn code_shape() {
        let code = unique_code(|_| false);
        assert_eq!(code.len(), FLIGHT_CODE_LEN);
        assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn taken_codes_are_retried() {
        let attempts = Cell::new(0);
        let code = unique_code(|_| {
            attempts.set(attempts.get() + 1);
            attempts.get() < 4
        });
        assert_eq!(attempts.get(), 4);
        assert_eq!(code.len(), FLIGHT_CODE_LEN);
    }
}
