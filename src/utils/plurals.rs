/// `"1 batch"`, `"3 batches"`.
pub fn pluralize(count: usize, singular: &str, plural: Option<&str>) -> String {
    let word = match (count, plural) {
        (1, _) => singular.to_string(),
        (_, Some(p)) => p.to_string(),
        (_, None) => format!("{singular}s"),
    };
    format!("{count} {word}")
}

#[cfg(test)]
mod tests {
    use super::pluralize;

    #[test]
    fn counts_with_word() {
        assert_eq!(pluralize(1, "row", None), "1 row");
        assert_eq!(pluralize(0, "row", None), "0 rows");
        assert_eq!(pluralize(2, "batch", Some("batches")), "2 batches");
    }
}
