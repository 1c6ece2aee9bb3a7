use uuid::Uuid;

const BASE62_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

pub fn base62(mut n: u128) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(BASE62_CHARS[(n % 62) as usize]);
        n /= 62;
    }
    digits.iter().rev().map(|&b| b as char).collect()
}

/// Random id for a sampling batch or run.
pub fn gen_batch_id() -> String {
    base62(Uuid::new_v4().as_u128())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_most_significant_digit_first() {
        assert_eq!(base62(0), "0");
        assert_eq!(base62(61), "z");
        assert_eq!(base62(62), "10");
        assert_eq!(base62(62 * 62 + 11), "10B");
    }

    #[test]
    fn batch_ids_are_alphanumeric_and_distinct() {
        let a = gen_batch_id();
        let b = gen_batch_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
