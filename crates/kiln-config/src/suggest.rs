/// Closest of `options` to `given` by edit distance, when it is close enough
/// to be a plausible typo.
pub fn name_suggestion(given: &str, options: &[String]) -> Option<String> {
    const MAX_DISTANCE: usize = 3;
    options
        .iter()
        .map(|opt| (levenshtein(given, opt), opt))
        .filter(|(d, _)| *d < MAX_DISTANCE)
        .min_by_key(|(d, _)| *d)
        .map(|(_, opt)| opt.clone())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut cur = Vec::with_capacity(b.len() + 1);
        cur.push(i + 1);
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            cur.push((prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1));
        }
        prev = cur;
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggests_close_names_only() {
        let known = vec!["null.ubuntu".to_string(), "file.alpine".to_string()];
        assert_eq!(name_suggestion("null.ubunt", &known).as_deref(), Some("null.ubuntu"));
        assert_eq!(name_suggestion("docker.debian", &known), None);
    }

    #[test]
    fn distance() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }
}
