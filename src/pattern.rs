/// Wildcard matching for CGI patterns and referer policy.  A pattern is a
/// `|`-separated list of alternatives; within one alternative `*` matches
/// any span without a slash, `**` matches any span at all, and `?` matches
/// a single character.  An alternative must consume the whole string.
pub fn matches(pattern: &str, string: &str) -> bool {
    pattern
        .split('|')
        .any(|alt| match_one(alt.as_bytes(), string.as_bytes()))
}

fn match_one(p: &[u8], s: &[u8]) -> bool {
    match p.first() {
        None => s.is_empty(),
        Some(b'*') => {
            let (rest, max_span) = if p.get(1) == Some(&b'*') {
                (&p[2..], s.len())
            } else {
                (&p[1..], s.iter().position(|&c| c == b'/').unwrap_or(s.len()))
            };
            // Longest span first, like the original matcher.
            (0..=max_span).rev().any(|i| match_one(rest, &s[i..]))
        }
        Some(b'?') if !s.is_empty() => match_one(&p[1..], &s[1..]),
        Some(&c) if !s.is_empty() && s[0] == c => match_one(&p[1..], &s[1..]),
        _ => false,
    }
}
