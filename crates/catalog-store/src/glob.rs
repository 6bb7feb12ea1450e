//! Glob-style pattern matching with Redis `MATCH` semantics.
//!
//! Supported syntax:
//! - `*` matches any run of characters, including none
//! - `?` matches exactly one character
//! - `[abc]`, `[a-z]`, `[^a]` match one character from (or outside) a class
//! - `\x` matches `x` literally

/// Characters with special meaning inside a pattern.
const META: &[char] = &['*', '?', '[', ']', '\\'];

/// Returns `true` if `text` matches `pattern` in full.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    // Resume point for the most recent `*`: (pattern index after it, text index).
    let mut resume: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            if p[pi] == '*' {
                while pi < p.len() && p[pi] == '*' {
                    pi += 1;
                }
                if pi == p.len() {
                    return true;
                }
                resume = Some((pi, ti));
                continue;
            }
            let (width, matched) = match_one(&p[pi..], t[ti]);
            if matched {
                pi += width;
                ti += 1;
                continue;
            }
        }
        match resume {
            Some((star_pi, star_ti)) => {
                pi = star_pi;
                ti = star_ti + 1;
                resume = Some((star_pi, star_ti + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Escape every metacharacter in `literal` so it matches only itself.
pub fn escape(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for ch in literal.chars() {
        if META.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Returns `true` if `s` contains any pattern metacharacter.
pub fn has_meta(s: &str) -> bool {
    s.contains(META)
}

/// Match one non-`*` pattern element against `c`.
///
/// Returns the pattern width consumed and whether it matched.
fn match_one(p: &[char], c: char) -> (usize, bool) {
    match p[0] {
        '?' => (1, true),
        '\\' if p.len() > 1 => (2, p[1] == c),
        '[' => match_class(p, c),
        literal => (1, literal == c),
    }
}

fn match_class(p: &[char], c: char) -> (usize, bool) {
    let mut i = 1;
    let negate = p.get(i) == Some(&'^');
    if negate {
        i += 1;
    }
    let mut matched = false;
    while i < p.len() && p[i] != ']' {
        if p[i] == '\\' && i + 1 < p.len() {
            matched |= p[i + 1] == c;
            i += 2;
        } else if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let (mut lo, mut hi) = (p[i], p[i + 2]);
            if lo > hi {
                std::mem::swap(&mut lo, &mut hi);
            }
            matched |= lo <= c && c <= hi;
            i += 3;
        } else {
            matched |= p[i] == c;
            i += 1;
        }
    }
    // An unterminated class runs to the end of the pattern.
    let width = if i < p.len() { i + 1 } else { i };
    (width, matched != negate)
}
