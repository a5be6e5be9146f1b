use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const MIN_PASSWORD_LEN: usize = 8;
pub const USERNAME_LEN: std::ops::RangeInclusive<usize> = 3..=150;

pub fn new_salt() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex(&hasher.finalize())
}

pub fn verify_password(salt: &str, expected_hash: &str, password: &str) -> bool {
    let got = hash_password(salt, password);
    // Constant-time compare.
    got.len() == expected_hash.len()
        && got
            .bytes()
            .zip(expected_hash.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// First + last initial, else first-name initial, else username initial.
pub fn initials(first_name: &str, last_name: &str, username: &str) -> String {
    let first = first_name.trim().chars().next();
    let last = last_name.trim().chars().next();
    let out: String = match (first, last) {
        (Some(f), Some(l)) => [f, l].iter().collect(),
        (Some(f), None) => f.to_string(),
        _ => username.trim().chars().next().map(String::from).unwrap_or_default(),
    };
    out.to_uppercase()
}

fn fold_accent(c: char) -> Option<char> {
    let folded = match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        'ñ' => 'n',
        c if c.is_ascii() => c,
        _ => return None,
    };
    Some(folded)
}

/// Lowercase ASCII words joined by `-`; accents folded, other symbols
/// dropped.
pub fn slugify(raw: &str) -> String {
    let mut out = String::new();
    let mut pending_dash = false;
    for c in raw.trim().to_lowercase().chars().filter_map(fold_accent) {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else if c.is_whitespace() || c == '-' || c == '_' {
            pending_dash = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salted_hashes_differ_and_verify() {
        let a = hash_password("s1", "correct horse");
        let b = hash_password("s2", "correct horse");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(verify_password("s1", &a, "correct horse"));
        assert!(!verify_password("s1", &a, "correct horsE"));
        assert_ne!(new_salt(), new_salt());
    }

    #[test]
    fn initials_fallbacks() {
        assert_eq!(initials("ana", "souza", "ana.s"), "AS");
        assert_eq!(initials("ana", "", "ana.s"), "A");
        assert_eq!(initials("", "", "zeca"), "Z");
    }

    #[test]
    fn slugs() {
        assert_eq!(slugify("Cálculo Diferencial II"), "calculo-diferencial-ii");
        assert_eq!(slugify("  C++ & Data_Structures "), "c-data-structures");
        assert_eq!(slugify("Física - Óptica"), "fisica-optica");
        assert_eq!(slugify("!!!"), "");
    }
}
