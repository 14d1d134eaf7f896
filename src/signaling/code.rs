//! Room codes: 6 characters from a 32-symbol alphabet with the visually
//! ambiguous `0/O/1/I` left out, so a code can be read over the phone.

use rand::Rng;

pub const CODE_LEN: usize = 6;
pub const CODE_ALPHABET: &str = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    let chars: Vec<char> = CODE_ALPHABET.chars().collect();
    (0..CODE_LEN)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect()
}

/// Uppercase and validate a user-entered code. Codes are case-insensitive on
/// entry but stored uppercase.
pub fn normalize_code(input: &str) -> Option<String> {
    let code: String = input.trim().to_uppercase();
    if code.len() == CODE_LEN && code.chars().all(|c| CODE_ALPHABET.contains(c)) {
        Some(code)
    } else {
        None
    }
}
